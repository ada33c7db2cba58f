//! CLI entry point (SPEC_FULL §6). Parses arguments, opens the target
//! process, drives the orchestrator, and writes the reconstructed image to
//! disk. Everything below this module is a thin wrapper around OS services;
//! the reconstruction logic itself lives in [`lazarus::orchestrator`].

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
#[cfg(windows)]
use log::error;

#[derive(Parser, Debug)]
#[command(
    name = "lazarus",
    about = "Reconstructs an on-disk PE image from a protected process's memory",
    version
)]
struct Args {
    /// Target process image name, e.g. "target.exe".
    #[arg(short = 'p', long = "process")]
    process: String,

    /// Module within the process to dump. Defaults to the main module.
    #[arg(short = 'm', long = "module")]
    module: Option<String>,

    /// Output file path. Defaults to the module name in the current directory.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Advisory harvest target in [0.0, 1.0].
    #[arg(short = 'd', long = "decryption-factor", default_value_t = 1.0)]
    decryption_factor: f32,

    /// Reconstruct the import directory (main module only).
    #[arg(short = 'i', long = "resolve-imports")]
    resolve_imports: bool,

    /// Poll until the target process is launched instead of failing immediately.
    #[arg(short = 'w', long = "wait")]
    wait: bool,

    /// Rebase the image to this base address (hex, e.g. 0x150000000) before writing.
    #[arg(long = "rebase")]
    rebase: Option<String>,

    /// Also write a full-memory minidump to this path.
    #[arg(long = "minidump")]
    minidump: Option<PathBuf>,

    /// Section names to drop from the image table before harvesting.
    #[arg(long = "ignore-section")]
    ignore_sections: Vec<String>,
}

#[cfg(windows)]
fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match windows_impl::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(windows))]
fn main() -> ExitCode {
    env_logger::init();
    let _ = Args::parse();
    eprintln!(
        "lazarus reconstructs images from a live Windows process and has no backend on this platform"
    );
    ExitCode::FAILURE
}

#[cfg(windows)]
mod windows_impl {
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use std::time::Duration;

    use log::info;
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Console::SetConsoleCtrlHandler;

    use lazarus::error::DumperError;
    use lazarus::orchestrator::{self, DumpRequest};
    use lazarus::process::fake::SharedCancellationToken;
    use lazarus::process::live::LiveProcess;
    use lazarus::process::{Module, Process};

    use super::Args;

    static CANCEL_TOKEN: OnceLock<SharedCancellationToken> = OnceLock::new();

    unsafe extern "system" fn handle_console_ctrl(_ctrl_type: u32) -> BOOL {
        if let Some(token) = CANCEL_TOKEN.get() {
            info!("cancellation requested, finishing the current page read and aborting");
            token.cancel();
        }
        BOOL::from(true)
    }

    pub fn run(args: Args) -> Result<(), DumperError> {
        let rebase_to = args.rebase.as_deref().map(parse_hex_u64).transpose()?;

        let request = DumpRequest {
            module_name: args.module.clone(),
            decryption_factor: args.decryption_factor,
            resolve_imports: args.resolve_imports,
            rebase_to,
            minidump_path: args.minidump.clone(),
            ignore_sections: args.ignore_sections.clone(),
            ..DumpRequest::default()
        };
        request.validate()?;

        let cancel = CANCEL_TOKEN.get_or_init(SharedCancellationToken::new).clone();
        unsafe {
            let _ = SetConsoleCtrlHandler(Some(handle_console_ctrl), true);
        }

        let process = if args.wait {
            wait_for_process(&args.process, &cancel)?
        } else {
            LiveProcess::open_by_name(&args.process)?
        };

        let output_path = args.output.clone().unwrap_or_else(|| {
            let module = process.find_module(args.module.as_deref());
            match module {
                Ok(m) => PathBuf::from(m.name().to_string()),
                Err(_) => PathBuf::from(&args.process),
            }
        });

        let image = orchestrator::run(&process, &request, &cancel)?;
        image.save_to_file(&output_path)?;
        info!("wrote {} bytes to {:?}", image.len(), output_path);
        println!("[+] wrote {:?}", output_path);
        Ok(())
    }

    fn wait_for_process(
        name: &str,
        cancel: &SharedCancellationToken,
    ) -> Result<LiveProcess, DumperError> {
        use lazarus::process::CancellationToken;
        loop {
            match LiveProcess::open_by_name(name) {
                Ok(process) => return Ok(process),
                Err(DumperError::NotFound(_)) => {
                    if cancel.is_cancelled() {
                        return Err(DumperError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn parse_hex_u64(s: &str) -> Result<u64, DumperError> {
        let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
        u64::from_str_radix(trimmed, 16)
            .map_err(|_| DumperError::Malformed(format!("invalid hex base address: {s}")))
    }
}
