//! Command line for a newly launched ComfyUI instance.
//!
//! Building the command is pure; spawning it belongs to the process
//! executor in the plugin crate.

use std::path::{Path, PathBuf};

use crate::error::TaskError;
use crate::roles::RoleFlags;

/// Interpreter used when the embedded one is missing.
pub const FALLBACK_INTERPRETER: &str = "python3";

/// Target platform of the launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Unix,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Everything that shapes the launch arguments.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// ComfyUI install root, containing `ComfyUI/main.py`.
    pub install_root: PathBuf,
    pub port: u16,
    pub gpu_index: Option<u32>,
    pub roles: RoleFlags,
    /// Pass `-s` to the interpreter.
    pub no_user_site: bool,
    /// Only set for a user-specified output directory.
    pub output_directory: Option<PathBuf>,
    pub platform: HostPlatform,
}

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Path of the embedded interpreter under `install_root`.
pub fn embedded_interpreter(install_root: &Path, platform: HostPlatform) -> PathBuf {
    let exe = match platform {
        HostPlatform::Windows => "python.exe",
        HostPlatform::Unix => "python",
    };
    install_root.join("python_embeded").join(exe)
}

pub fn main_script(install_root: &Path) -> PathBuf {
    install_root.join("ComfyUI").join("main.py")
}

/// Build the launch command. Fails when `ComfyUI/main.py` is missing.
pub fn build_launch_command(options: &LaunchOptions) -> Result<LaunchCommand, TaskError> {
    let main_py = main_script(&options.install_root);
    if !main_py.exists() {
        return Err(TaskError::Setup(format!(
            "ComfyUI main.py not found at: {}. Please check your ComfyUI install path",
            main_py.display()
        )));
    }

    let embedded = embedded_interpreter(&options.install_root, options.platform);
    let program = if embedded.exists() {
        embedded
    } else {
        tracing::warn!(
            path = %embedded.display(),
            "Embedded Python not found, falling back to {FALLBACK_INTERPRETER}",
        );
        PathBuf::from(FALLBACK_INTERPRETER)
    };

    Ok(LaunchCommand {
        program,
        args: launch_args(options, &main_py),
    })
}

/// Argument list, in the order ComfyUI documents them.
pub fn launch_args(options: &LaunchOptions, main_py: &Path) -> Vec<String> {
    let mut args = Vec::new();
    if options.no_user_site {
        args.push("-s".to_string());
    }
    args.push(main_py.display().to_string());
    args.push("--port".to_string());
    args.push(options.port.to_string());

    if let Some(gpu) = options.gpu_index {
        args.push("--cuda-device".to_string());
        args.push(gpu.to_string());
    }
    if options.roles.listens_externally() {
        args.push("--listen".to_string());
        args.push("--enable-cors-header".to_string());
    }
    if options.platform == HostPlatform::Windows {
        args.push("--windows-standalone-build".to_string());
    }
    args.push("--disable-auto-launch".to_string());

    match &options.output_directory {
        Some(dir) => {
            args.push("--output-directory".to_string());
            args.push(dir.display().to_string());
        }
        None => tracing::debug!("Not passing --output-directory, ComfyUI uses its default"),
    }
    args
}
