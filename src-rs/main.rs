use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod capture_loop;
mod desktop;
mod folders;
mod megacmd;
mod prompts;
mod similarity;
mod tracker;
mod upload;

use capture_loop::{fresh_output_dir, run_capture, CaptureConfig, PagingAction, RunSummary};
use desktop::{PageKey, Point, SystemDesktop};
use folders::{discover_candidate_folders, render_candidates, resolve_folder_arg, Selection};
use megacmd::{remote_join, MegaCmd, ToolSearch, DEFAULT_REMOTE_DEST};
use upload::{execute_plan, missing_targets, UploadError, UploadPlan};

#[derive(Parser, Debug)]
#[command(
    name = "pagecap",
    version,
    about = "Page through a reader window, save each new page as PNG, and push the folder to MEGA"
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Page, capture and save until the page stops changing
    Capture(CaptureArgs),
    /// Pick captured folders and upload them with MEGAcmd
    Upload(UploadArgs),
    /// Show the live pointer position; Enter records, Esc quits
    Track,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Output folder name (letters, digits, _ and -); prompted when omitted
    #[arg(long)]
    name: Option<String>,
    /// Directory the output folder is created in (default: PAGECAP_OUT_DIR or .)
    #[arg(long)]
    base: Option<PathBuf>,
    /// Page with this key
    #[arg(long, value_enum, conflicts_with = "click")]
    key: Option<PageKey>,
    /// Page by clicking at X,Y screen coordinates
    #[arg(long, value_name = "X,Y", value_parser = parse_click, allow_hyphen_values = true)]
    click: Option<Point>,
    /// Maximum number of iterations
    #[arg(long, default_value_t = 10_000)]
    max: u32,
    /// Exact-match pixel ratio at which two captures count as the same page
    #[arg(long, default_value_t = similarity::DEFAULT_SAME_THRESHOLD)]
    threshold: f64,
    /// Seconds to wait before the first capture
    #[arg(long, default_value_t = 10)]
    start_delay: u64,
    /// Seconds to wait before re-checking a repeated page
    #[arg(long, default_value_t = 5)]
    cooldown: u64,
    /// Skip the Alt+PrintScreen clipboard capture and grab the window region directly
    #[arg(long, action = ArgAction::SetTrue)]
    no_clipboard: bool,
    /// Upload the folder after capturing without asking
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "no_upload")]
    upload: bool,
    /// Never upload after capturing
    #[arg(long, action = ArgAction::SetTrue)]
    no_upload: bool,
    /// Remote MEGA folder to upload into
    #[arg(long, default_value = DEFAULT_REMOTE_DEST)]
    dest: String,
    /// Wait for the upload to finish instead of queueing it
    #[arg(long, action = ArgAction::SetTrue)]
    wait_upload: bool,
    /// Print the run summary as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Directory whose subfolders are offered (default: PAGECAP_OUT_DIR or .)
    #[arg(long)]
    base: Option<PathBuf>,
    /// Remote MEGA folder to upload into
    #[arg(long, default_value = DEFAULT_REMOTE_DEST)]
    dest: String,
    /// Folder name or path to upload; skips the selection prompt
    #[arg(long)]
    folder: Option<String>,
    /// Skip folders that already exist at the destination
    #[arg(long, action = ArgAction::SetTrue)]
    skip_if_exists: bool,
    /// Do not ask for confirmation
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
    /// Print the MEGAcmd commands without running them
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Wait for each upload to finish instead of queueing it
    #[arg(long, action = ArgAction::SetTrue)]
    wait: bool,
    /// List candidate folders and exit
    #[arg(long, action = ArgAction::SetTrue)]
    list: bool,
    /// With --list, print candidates as JSON
    #[arg(long, action = ArgAction::SetTrue, requires = "list")]
    json: bool,
}

fn parse_click(raw: &str) -> std::result::Result<Point, String> {
    prompts::parse_point(raw).map_err(|err| format!("{err:#}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<UploadError>()
                .map(UploadError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "pagecap=info",
        1 => "pagecap=debug",
        _ => "pagecap=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Capture(args) => command_capture(args),
        Commands::Upload(args) => command_upload(args),
        Commands::Track => command_track(),
    }
}

fn command_capture(args: CaptureArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be between 0 and 1, got {}", args.threshold);
    }
    if args.max == 0 {
        bail!("--max must be at least 1");
    }

    let base = args.base.clone().unwrap_or_else(default_base_dir);
    let name = match args.name.as_deref() {
        Some(name) => {
            prompts::validate_folder_name(name).map_err(|msg| anyhow!("invalid --name: {msg}"))?;
            name.to_string()
        }
        None => prompts::folder_name()?,
    };
    let action = match (args.key, args.click) {
        (Some(key), _) => PagingAction::Key { key },
        (None, Some(at)) => PagingAction::Click { at },
        (None, None) => prompts::paging_action()?,
    };

    let output_dir = fresh_output_dir(&base, &name);
    if output_dir != base.join(&name) {
        info!(
            "{} already holds files; writing to {}",
            base.join(&name).display(),
            output_dir.display()
        );
    }

    let mut config = CaptureConfig::new(action, output_dir);
    config.max_iterations = args.max;
    config.threshold = args.threshold;
    config.same_cooldown = Duration::from_secs(args.cooldown);
    if args.no_clipboard {
        config.clipboard = None;
    }

    println!("page capture");
    println!("  max iterations: {}", config.max_iterations);
    println!("  paging: {}", config.action);
    println!("  output: {}", abs_path(&config.output_dir).display());
    println!("  stops when the same page is captured twice in a row");

    if args.start_delay > 0 {
        println!(
            "starting in {}s; bring the reader window to the front.",
            args.start_delay
        );
        thread::sleep(Duration::from_secs(args.start_delay));
    }

    // Synthetic input is global; an interrupted run could leave keys pressed.
    ctrlc::set_handler(|| warn!("interrupt ignored while capturing"))
        .context("failed to install interrupt handler")?;

    let mut desktop = SystemDesktop::new()?;
    let summary = run_capture(&mut desktop, &config);
    report_capture(&summary, args.json)?;

    if summary.saved == 0 || !summary.output_dir.is_dir() {
        println!("nothing was saved; skipping upload");
        return Ok(());
    }

    let wants_upload = if args.upload {
        true
    } else if args.no_upload {
        false
    } else {
        prompts::confirm("Upload the folder to MEGA?", false).unwrap_or_else(|err| {
            warn!("{err:#}; skipping upload");
            false
        })
    };
    if !wants_upload {
        println!("upload skipped");
        return Ok(());
    }

    upload_captured_folder(&summary.output_dir, args.dest.trim(), !args.wait_upload)
}

fn report_capture(summary: &RunSummary, json: bool) -> Result<()> {
    println!(
        "done: saved {} image(s) in {} iteration(s)",
        summary.saved, summary.last_iteration
    );
    if summary.saved > 0 {
        println!("folder: {}", abs_path(&summary.output_dir).display());
    }
    if json {
        println!("{}", serde_json::to_string(summary)?);
    }
    Ok(())
}

fn upload_captured_folder(folder: &Path, dest: &str, queue: bool) -> Result<()> {
    if dest.is_empty() {
        return Err(UploadError::InvalidInput("--dest is empty".to_string()).into());
    }
    let mega = MegaCmd::locate(&ToolSearch::from_env()).map_err(UploadError::ToolMissing)?;
    let plan = UploadPlan {
        targets: vec![folder.to_path_buf()],
        dest: dest.to_string(),
        skip_if_exists: false,
        dry_run: false,
        queue,
    };
    execute_plan(&mega, &plan, prompts::credentials)?;

    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    println!("MEGA path: {}", remote_join(dest, &name));
    if queue {
        println!("queued; check progress with `mega-transfers`.");
    } else {
        println!("upload complete.");
    }
    Ok(())
}

fn command_upload(args: UploadArgs) -> Result<()> {
    let base_raw = args.base.clone().unwrap_or_else(default_base_dir);
    let base = fs::canonicalize(&base_raw)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| {
            UploadError::InvalidInput(format!(
                "base directory does not exist: {}",
                base_raw.display()
            ))
        })?;

    let dest = args.dest.trim().to_string();
    if dest.is_empty() {
        return Err(UploadError::InvalidInput("--dest is empty".to_string()).into());
    }

    if args.list {
        let candidates = discover_candidate_folders(&base)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        } else if candidates.is_empty() {
            println!("no folders with images under {}", base.display());
        } else {
            println!("{}", render_candidates(&candidates));
        }
        return Ok(());
    }

    let mut selected_all = false;
    let targets: Vec<PathBuf> = match args.folder.as_deref() {
        Some(folder) => vec![resolve_folder_arg(&base, folder)],
        None => {
            let candidates = discover_candidate_folders(&base)?;
            if candidates.is_empty() {
                println!("no folders with images under {}", base.display());
                return Ok(());
            }
            println!("\nfolders available for upload:");
            println!("{}", render_candidates(&candidates));
            match prompts::folder_selection(&candidates) {
                Ok(Selection::All) => {
                    selected_all = true;
                    candidates.iter().map(|c| c.path.clone()).collect()
                }
                Ok(Selection::Indices(picked)) => picked
                    .iter()
                    .map(|&i| candidates[i - 1].path.clone())
                    .collect(),
                Ok(Selection::Quit) => Vec::new(),
                Err(err) => {
                    warn!("{err:#}");
                    Vec::new()
                }
            }
        }
    };

    if targets.is_empty() {
        println!("nothing selected; exiting.");
        return Ok(());
    }

    let missing = missing_targets(&targets);
    if !missing.is_empty() {
        let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        return Err(UploadError::InvalidInput(format!("folder not found: {}", list.join(", "))).into());
    }

    println!("\nselected:");
    for target in &targets {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        println!("- {name}  ({})", target.display());
    }
    println!("MEGA destination: {dest}");

    let skip_if_exists = args.skip_if_exists || selected_all;
    if selected_all && !args.skip_if_exists {
        println!("note: `all` selected, so folders already present at the destination are skipped.");
    }

    if !args.yes {
        match prompts::confirm("Upload these folders?", false) {
            Ok(true) => {}
            Ok(false) => {
                println!("cancelled.");
                return Ok(());
            }
            Err(err) => return Err(UploadError::Aborted(format!("{err:#}")).into()),
        }
    }

    let mega = MegaCmd::locate(&ToolSearch::from_env()).map_err(UploadError::ToolMissing)?;
    let plan = UploadPlan {
        targets,
        dest,
        skip_if_exists,
        dry_run: args.dry_run,
        queue: !args.wait,
    };
    let report = execute_plan(&mega, &plan, prompts::credentials)?;

    if plan.dry_run {
        println!("\n[dry-run] done");
    } else if !report.uploaded.is_empty() {
        if plan.queue {
            println!("\ndone: uploads queued; check progress with `mega-transfers`.");
        } else {
            println!("\ndone: uploads finished.");
        }
    } else {
        println!("\ndone: every folder already exists remotely; nothing uploaded.");
    }
    Ok(())
}

fn command_track() -> Result<()> {
    let positions = tracker::run_tracker()?;
    println!("{}", tracker::render_positions(&positions));
    Ok(())
}

fn default_base_dir() -> PathBuf {
    env::var("PAGECAP_OUT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}
