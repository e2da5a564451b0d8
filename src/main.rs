#[macro_use]
extern crate log;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Error, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use wperf_sampling::sampler::EventSpec;
use wperf_sampling::storage;
use wperf_sampling::tree::export;
use wperf_sampling::ui::summary::{self, Layout};
use wperf_sampling::{
    OverheadMode, RunOutcome, SamplingSession, SamplingSettings, SamplingTree, SamplingTreeBuilder, SessionEvent,
};

#[derive(Parser)]
#[command(
    name = "wperf-sampling",
    version,
    about = "Record samples with wperf and see where they landed",
    after_help = "\
EXAMPLES:
    wperf-sampling record -e ld_spec:100000 --pe_file app.exe --timeout 5
    wperf-sampling show ~/records/wperf-2026-10-17-120000.json.gz
    wperf-sampling export run.json --out x_mul.json --event ld_spec --function x_mul"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run wperf, then print and save the result
    Record(RecordArgs),
    /// Print the overhead tree of a saved result
    Show {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Show function and source line overhead as a share of all samples
        #[arg(long)]
        absolute: bool,
        /// Deepest tree level to print (0 = root only)
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Write an event or a function of a saved result to a new file
    Export {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
        #[arg(long)]
        event: Option<String>,
        #[arg(long, requires = "event")]
        function: Option<String>,
    },
}

#[derive(clap::Args)]
struct RecordArgs {
    /// JSON settings file. Flags given on the command line take precedence
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,
    /// The wperf executable
    #[arg(long, value_name = "PATH")]
    wperf: Option<PathBuf>,
    /// Events to sample, as name or name:interval
    #[arg(short, long = "event", value_delimiter = ',')]
    events: Vec<String>,
    /// Sampling interval for events without one
    #[arg(short, long)]
    frequency: Option<u64>,
    #[arg(short, long)]
    core: Option<u32>,
    /// Stop recording after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
    #[arg(long = "pe_file", value_name = "FILE")]
    pe_file: Option<PathBuf>,
    #[arg(long = "pdb_file", value_name = "FILE")]
    pdb_file: Option<PathBuf>,
    #[arg(long = "image_name")]
    image_name: Option<String>,
    /// Record with SPE using this filter, e.g. load_filter=1
    #[arg(long, value_name = "FILTER")]
    spe: Option<String>,
    #[arg(long)]
    no_annotate: bool,
    #[arg(long)]
    no_disassemble: bool,
    /// CPUs wperf may run on, as a hex mask
    #[arg(long, value_name = "MASK", value_parser = parse_mask)]
    affinity: Option<u64>,
    /// Take the driver from another wperf process straight away
    #[arg(long)]
    force_lock: bool,
    /// Retry with force lock without asking when the driver is in use
    #[arg(short, long)]
    yes: bool,
    /// Show function and source line overhead as a share of all samples
    #[arg(long)]
    absolute: bool,
    /// Echo wperf's output while it runs
    #[arg(short, long)]
    verbose: bool,
    /// Where to save wperf's JSON output. Default: a timestamped file in the cache directory
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,
    /// Passed to wperf unchanged
    #[arg(last = true)]
    extra: Vec<String>,
}

fn parse_mask(text: &str) -> Result<u64, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad CPU mask `{}`: {}", text, e))
}

impl RecordArgs {
    fn sampling_settings(&self) -> Result<SamplingSettings> {
        let mut settings = match &self.settings {
            Some(path) => SamplingSettings::from_file(path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?,
            None => SamplingSettings::default(),
        };
        if let Some(wperf) = &self.wperf {
            settings.wperf_path = wperf.clone();
        }
        if !self.events.is_empty() {
            settings.events = self
                .events
                .iter()
                .map(|e| EventSpec::parse(e))
                .collect::<Result<Vec<_>, _>>()?;
        }
        if self.frequency.is_some() {
            settings.frequency = self.frequency;
        }
        if self.core.is_some() {
            settings.core = self.core;
        }
        if self.timeout.is_some() {
            settings.timeout_secs = self.timeout;
        }
        if self.pe_file.is_some() {
            settings.pe_file = self.pe_file.clone();
        }
        if self.pdb_file.is_some() {
            settings.pdb_file = self.pdb_file.clone();
        }
        if self.image_name.is_some() {
            settings.image_name = self.image_name.clone();
        }
        if self.spe.is_some() {
            settings.spe_filter = self.spe.clone();
        }
        if self.no_annotate {
            settings.annotate = false;
        }
        if self.no_disassemble {
            settings.disassemble = false;
        }
        if self.affinity.is_some() {
            settings.cpu_affinity = self.affinity;
        }
        if self.force_lock {
            settings.force_lock = true;
        }
        settings.extra_args.extend(self.extra.iter().cloned());
        Ok(settings)
    }

    fn mode(&self) -> OverheadMode {
        overhead_mode(self.absolute)
    }
}

fn overhead_mode(absolute: bool) -> OverheadMode {
    if absolute {
        OverheadMode::Absolute
    } else {
        OverheadMode::Relative
    }
}

fn do_main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Record(args) => record(args),
        Command::Show { file, absolute, depth } => {
            let tree = wperf_sampling::load_from_file(&file, overhead_mode(absolute))
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let mut layout = Layout::for_terminal();
            layout.max_depth = depth;
            print_tree(&tree, layout)
        }
        Command::Export {
            file,
            out,
            event,
            function,
        } => {
            let tree = wperf_sampling::load_from_file(&file, OverheadMode::Relative)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let mut section = tree.root();
            if let Some(event) = event {
                section = tree
                    .find_event(&event)
                    .ok_or_else(|| anyhow!("No event named {} in {}", event, file.display()))?;
                if let Some(function) = function {
                    section = tree
                        .find_function(section, &function)
                        .ok_or_else(|| anyhow!("No function {} sampled by {}", function, event))?;
                }
            }
            export::export_to_file(&tree, section, &out)?;
            eprintln!("Wrote {} to {}", tree[section].label(), out.display());
            Ok(())
        }
    }
}

fn record(args: RecordArgs) -> Result<()> {
    let settings = args.sampling_settings()?;
    let (session, events) = SamplingSession::new();
    let session = Arc::new(session);

    if args.verbose {
        let output = session.subscribe_output();
        std::thread::spawn(move || {
            for line in output {
                eprintln!("{}", line.text);
            }
        });
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    let session_clone = session.clone();
    ctrlc::set_handler(move || {
        if interrupted_clone.swap(true, Ordering::SeqCst) {
            eprintln!("Multiple interrupts received, exiting with haste!");
            std::process::exit(1);
        }
        eprintln!("Interrupted.");
        if let Err(e) = session_clone.cancel_run() {
            error!("Failed to stop wperf: {}", e);
        }
    })
    .context("Failed to set Ctrl-C handler")?;

    session.start_run(&settings)?;
    eprintln!("Press Ctrl+C to stop");

    loop {
        let event = events
            .recv()
            .map_err(|_| anyhow!("The sampling session ended without a result"))?;
        match event {
            SessionEvent::RunCompleted {
                outcome: RunOutcome::Success(raw),
                record,
                label,
            } => {
                let record = record.ok_or_else(|| anyhow!("wperf succeeded but its output went missing"))?;
                let path = match &args.save {
                    Some(path) => path.clone(),
                    None => default_record_path()?,
                };
                storage::save_json(&raw, &path)
                    .with_context(|| format!("Failed to save the result to {}", path.display()))?;
                eprintln!("{}: saved to {}", label, path.display());
                let tree = SamplingTreeBuilder::new(args.mode()).build(record);
                return print_tree(&tree, Layout::for_terminal());
            }
            SessionEvent::RunCompleted {
                outcome: RunOutcome::Cancelled,
                ..
            } => {
                eprintln!("Recording cancelled.");
                return Ok(());
            }
            SessionEvent::RunCompleted {
                outcome: RunOutcome::Failure(stderr),
                ..
            } => return Err(anyhow!("wperf failed: {}", stderr.trim())),
            SessionEvent::RunFailed(e) if e.is_retryable() && !interrupted.load(Ordering::SeqCst) => {
                let retry = args.yes
                    || confirm("The wperf driver is in use by another process. Take it over? [y/N] ")?;
                if !retry {
                    return Err(e.into());
                }
                session.retry_with_force_lock(&settings)?;
            }
            SessionEvent::RunFailed(e) => return Err(e.into()),
        }
    }
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{}", question);
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn default_record_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "wperf-sampling")
        .ok_or_else(|| anyhow!("Couldn't find a cache directory, use --save"))?;
    let dir = dirs.cache_dir().join("records");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join(format!("wperf-{}.json.gz", Utc::now().format("%Y-%m-%d-%H%M%S"))))
}

fn print_tree(tree: &SamplingTree, layout: Layout) -> Result<()> {
    if let Some(info) = tree.root_info() {
        let kind = info.kind.feature_name().unwrap_or("event sampling");
        println!("{} ({}): {} samples, {} dropped", info.pe_file, kind, info.samples_generated, info.samples_dropped);
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    summary::write(tree, layout, &mut out)?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(x) = do_main() {
        eprintln!("Error. Causes: ");
        for c in Error::chain(&x) {
            eprintln!("- {}", c);
        }
        std::process::exit(1);
    }
}
