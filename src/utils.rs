//! Shared process helpers.

use std::path::Path;

use tokio::process::Command;

/// Script the provisioner writes and the launcher runs, per platform.
#[cfg(target_os = "windows")]
pub const LAUNCH_SCRIPT: &str = "run.bat";
#[cfg(not(target_os = "windows"))]
pub const LAUNCH_SCRIPT: &str = "run.sh";

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// `sh run.sh nogui` (or `cmd /C run.bat nogui`) inside `data_dir`.
pub fn launch_command(data_dir: &Path) -> Command {
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", LAUNCH_SCRIPT]);
        cmd
    };
    #[cfg(not(target_os = "windows"))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg(LAUNCH_SCRIPT);
        cmd
    };
    cmd.arg("nogui").current_dir(data_dir);
    apply_creation_flags(&mut cmd);
    cmd
}
