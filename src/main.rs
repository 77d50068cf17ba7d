use std::env;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use renderq::cache::{absolute_project_path, MetadataCache};
use renderq::config::{
    load_config, resolve_config_path, resolve_queue_path, write_starter_config, OnComplete,
    QueueConfig,
};
use renderq::extract::{outdated, BlenderExtractor, LoadReport, ProjectLoader};
use renderq::frame_spec::{self, ExclusionMode};
use renderq::hooks::SystemHooks;
use renderq::orchestrator::{Orchestrator, RunOptions, RunOutcome, RunSummary};
use renderq::process::SystemLauncher;
use renderq::progress::RunEvent;
use renderq::project::{Project, RenderModes, SettingField};
use renderq::queue::RenderQueue;
use renderq::run_state::SharedRunState;
use renderq::save_file::{self, SaveFile};

#[derive(Debug, Parser)]
#[command(name = "renderq")]
#[command(version = env!("RENDERQ_VERSION"))]
#[command(about = "Batch render queue for headless renderer runs")]
struct Cli {
    /// Config file (default: <user config dir>/renderq/renderq.yaml).
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,
    /// Queue save file (default: queue.json next to the config).
    #[arg(long = "queue", global = true)]
    queue: Option<PathBuf>,
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a starter config file.
    Init {
        #[arg(long = "force", default_value_t = false)]
        force: bool,
    },
    /// Print the frames a frame spec expands to.
    Frames {
        spec: String,
        /// Exclusions also drop frames added by later tokens.
        #[arg(long = "sticky", default_value_t = false)]
        sticky: bool,
    },
    /// Queue project files.
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove a project by index or path.
    Remove { target: String },
    /// Move a project to another position.
    Move { from: usize, to: usize },
    List,
    /// Flip whether a project takes part in the next run.
    Toggle {
        #[arg(required_unless_present = "all")]
        index: Option<usize>,
        /// Switch every project on or off instead.
        #[arg(long = "all", value_enum, conflicts_with = "index")]
        all: Option<Switch>,
    },
    /// Override one setting of a project, or of every project with --all.
    Set {
        #[arg(long = "all", default_value_t = false)]
        all: bool,
        #[arg(value_name = "[INDEX] FIELD VALUE", num_args = 2..=3, required = true)]
        args: Vec<String>,
    },
    /// Drop an override, falling back to the value from the file.
    Unset { index: usize, field: String },
    Show { index: usize },
    /// List projects whose file changed since it was loaded.
    Outdated,
    /// Re-read every outdated project.
    Reload,
    /// Render every active project in order. The mode flags given here
    /// replace the queue's saved modes.
    Render {
        #[arg(long = "selective", default_value_t = false)]
        selective: bool,
        #[arg(long = "markers", default_value_t = false)]
        markers: bool,
        #[arg(long = "shutdown", default_value_t = false)]
        shutdown: bool,
        /// Write the run summary next to the queue file.
        #[arg(long = "record", default_value_t = false)]
        record: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

struct Session {
    config: QueueConfig,
    queue_path: PathBuf,
    file: SaveFile,
    cache: MetadataCache,
    /// The save file on disk failed to load and must not be overwritten.
    queue_unreadable: bool,
    cache_unreadable: bool,
}

impl Session {
    fn open(
        config_override: Option<&Path>,
        queue_override: Option<&Path>,
        launch_cwd: &Path,
    ) -> Result<Self> {
        let config_path = resolve_config_path(config_override, launch_cwd)?;
        let config = load_config(&config_path, launch_cwd)?;
        let queue_path = resolve_queue_path(queue_override, &config.config_path, launch_cwd)?;
        let (file, queue_unreadable) = match save_file::load_if_present(&queue_path) {
            Ok(file) => (file, false),
            Err(error) => {
                tracing::error!(%error, "starting with an empty queue; the unreadable file is moved aside on the next save");
                (SaveFile::new(None, RenderQueue::default()), true)
            }
        };
        let (cache, cache_unreadable) = match MetadataCache::try_load(&config.cache_file) {
            Ok(cache) => (cache, false),
            Err(error) => {
                tracing::warn!(%error, "starting with an empty metadata cache");
                (MetadataCache::default(), true)
            }
        };
        tracing::debug!(
            config = %config.config_path.display(),
            queue = %queue_path.display(),
            projects = file.queue.len(),
            "session opened"
        );
        Ok(Self {
            config,
            queue_path,
            file,
            cache,
            queue_unreadable,
            cache_unreadable,
        })
    }

    fn save_queue(&mut self) -> Result<()> {
        if self.queue_unreadable && self.queue_path.exists() {
            let moved = save_file::set_aside(&self.queue_path).with_context(|| {
                format!("failed to move aside queue {}", self.queue_path.display())
            })?;
            eprintln!("Moved unreadable queue to {}", moved.display());
        }
        self.queue_unreadable = false;
        self.file.executable = Some(self.config.executable.clone());
        save_file::save(&self.queue_path, &self.file)
            .with_context(|| format!("failed to save queue {}", self.queue_path.display()))
    }

    fn save_cache(&mut self) -> Result<()> {
        if self.cache_unreadable && self.config.cache_file.exists() {
            let moved = MetadataCache::set_aside_unreadable(&self.config.cache_file)
                .with_context(|| {
                    format!(
                        "failed to move aside metadata cache {}",
                        self.config.cache_file.display()
                    )
                })?;
            tracing::warn!(path = %moved.display(), "kept unreadable metadata cache");
        }
        self.cache_unreadable = false;
        self.cache.save(&self.config.cache_file).with_context(|| {
            format!(
                "failed to write metadata cache {}",
                self.config.cache_file.display()
            )
        })
    }

    fn extractor(&self) -> BlenderExtractor {
        BlenderExtractor::new(&self.config.executable, &self.config.work_dir)
    }
}

fn main() -> Result<ExitCode> {
    let Cli {
        config,
        queue,
        verbose,
        command,
    } = Cli::parse();
    renderq::logging::init(verbose)?;
    let launch_cwd = env::current_dir().context("failed to resolve current directory")?;

    match command {
        Commands::Init { force } => {
            let config_path = resolve_config_path(config.as_deref(), &launch_cwd)?;
            write_starter_config(&config_path, force)?;
            println!("Wrote {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Frames { spec, sticky } => {
            let mode = if sticky {
                ExclusionMode::Sticky
            } else {
                ExclusionMode::Individual
            };
            match frame_spec::parse(&spec, mode) {
                Ok(frames) => {
                    println!("{frames}");
                    eprintln!("{} frames", frames.len());
                }
                Err(error) => {
                    tracing::warn!(%error, "frame spec yields no frames");
                    println!();
                    eprintln!("0 frames");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let mut session = Session::open(config.as_deref(), queue.as_deref(), &launch_cwd)?;
            run_queue_command(&mut session, command)
        }
    }
}

fn run_queue_command(session: &mut Session, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Add { files } => run_add(session, &files)?,
        Commands::Remove { target } => run_remove(session, &target)?,
        Commands::Move { from, to } => {
            session.file.queue.reorder(from, to)?;
            session.save_queue()?;
            println!("Moved #{from} to #{to}");
        }
        Commands::List => run_list(session),
        Commands::Toggle { index, all } => run_toggle(session, index, all)?,
        Commands::Set { all, args } => run_set(session, all, &args)?,
        Commands::Unset { index, field } => {
            let field: SettingField = field.parse()?;
            session.file.queue.clear_override(index, field)?;
            session.save_queue()?;
            println!("#{index} {field} reset");
        }
        Commands::Show { index } => run_show(session, index)?,
        Commands::Outdated => {
            let stale = outdated(&session.file.queue, &session.cache);
            if stale.is_empty() {
                println!("All projects are up to date");
            }
            for index in stale {
                let project = session.file.queue.get(index)?;
                println!("#{index} {}", project.file.display());
            }
        }
        Commands::Reload => {
            let extractor = session.extractor();
            let report = ProjectLoader::new(&extractor, &mut session.cache)
                .reload(&mut session.file.queue);
            session.save_cache()?;
            session.save_queue()?;
            print_report("Reloaded", &report);
        }
        Commands::Render {
            selective,
            markers,
            shutdown,
            record,
        } => return run_render(session, selective, markers, shutdown, record),
        Commands::Init { .. } | Commands::Frames { .. } => {
            bail!("this command does not use the queue")
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_add(session: &mut Session, files: &[PathBuf]) -> Result<()> {
    let extractor = session.extractor();
    let report = ProjectLoader::new(&extractor, &mut session.cache)
        .add_files(&mut session.file.queue, files);
    session.save_cache()?;
    if !report.added.is_empty() {
        session.save_queue()?;
    }
    print_report("Added", &report);
    if report.added.is_empty() {
        bail!("no project was added");
    }
    Ok(())
}

fn run_toggle(session: &mut Session, index: Option<usize>, all: Option<Switch>) -> Result<()> {
    match (index, all) {
        (_, Some(switch)) => {
            let active = switch == Switch::On;
            let changed = session.file.queue.set_all_active(active);
            if changed > 0 {
                session.save_queue()?;
            }
            println!(
                "All projects are now {} ({changed} changed)",
                if active { "active" } else { "inactive" }
            );
        }
        (Some(index), None) => {
            let active = session.file.queue.toggle(index)?;
            session.save_queue()?;
            println!(
                "#{index} is now {}",
                if active { "active" } else { "inactive" }
            );
        }
        (None, None) => bail!("toggle needs an index or --all"),
    }
    Ok(())
}

fn run_set(session: &mut Session, all: bool, args: &[String]) -> Result<()> {
    match (all, args) {
        (true, [field, value]) => {
            let field: SettingField = field.parse()?;
            let updated = session.file.queue.set_override_all(field, value)?;
            if updated > 0 {
                session.save_queue()?;
            }
            println!("{field} = {value} on {updated} projects");
        }
        (false, [index, field, value]) => {
            let index: usize = index
                .parse()
                .with_context(|| format!("invalid project index '{index}'"))?;
            let field: SettingField = field.parse()?;
            session.file.queue.set_override(index, field, value)?;
            session.save_queue()?;
            println!("#{index} {field} = {value}");
        }
        (true, _) => bail!("set --all takes FIELD VALUE"),
        (false, _) => bail!("set takes INDEX FIELD VALUE"),
    }
    Ok(())
}

fn run_remove(session: &mut Session, target: &str) -> Result<()> {
    let removed = match target.parse::<usize>() {
        Ok(index) => session.file.queue.remove(index)?,
        Err(_) => {
            let file = absolute_project_path(Path::new(target))?;
            session.file.queue.remove_file(&file)?
        }
    };
    session.save_queue()?;
    println!("Removed {}", removed.file.display());
    Ok(())
}

fn run_list(session: &Session) {
    let queue = &session.file.queue;
    println!(
        "Modes: selective={} markers={}",
        on_off(queue.modes.selective),
        on_off(queue.modes.markers)
    );
    if queue.is_empty() {
        println!("Queue is empty");
        return;
    }
    for (index, project) in queue.projects().iter().enumerate() {
        println!(
            "#{index} [{}] {}  frames={}  scene={}  camera={}  format={}{}",
            if project.active { "x" } else { " " },
            project.file.display(),
            project.frames(),
            project.scene().unwrap_or_default(),
            project.camera().unwrap_or_else(|| String::from("(none)")),
            project.file_format_name(),
            if project.is_outdated(&session.cache) {
                "  (outdated)"
            } else {
                ""
            }
        );
    }
}

fn run_show(session: &Session, index: usize) -> Result<()> {
    let queue = &session.file.queue;
    let project: &Project = queue.get(index)?;
    println!("#{index} {}", project.file.display());
    println!("active: {}", project.active);
    for row in project.setting_rows() {
        println!(
            "{:<24} base={:<20} override={:<20} -> {}",
            row.field.as_str(),
            row.base,
            row.override_value.as_deref().unwrap_or("-"),
            row.resolved
        );
    }
    println!("markers: {}", project.markers_spec());
    match project.frame_list(queue.modes) {
        Ok(frames) => println!("frame list ({}): {frames}", frames.len()),
        Err(error) => println!("frame list: {error}"),
    }
    Ok(())
}

fn run_render(
    session: &mut Session,
    selective: bool,
    markers: bool,
    shutdown: bool,
    record: bool,
) -> Result<ExitCode> {
    let modes = RenderModes { selective, markers };
    if session.file.queue.modes != modes {
        session.file.queue.modes = modes;
        session.save_queue()?;
    }
    for index in outdated(&session.file.queue, &session.cache) {
        let project = session.file.queue.get(index)?;
        tracing::warn!(project = %project.file.display(), "project changed since it was loaded; run `renderq reload`");
    }

    let config = &session.config;
    let hooks = SystemHooks::new(
        config.wake_command.clone(),
        config.shutdown_command.clone(),
        config.shutdown_delay_secs,
    );
    let shutdown_handle = hooks.shutdown_handle();
    let mut orchestrator = Orchestrator::new(
        config.run_settings(),
        Arc::new(SystemLauncher),
        Arc::new(hooks),
    );
    let options = RunOptions {
        shutdown_on_finish: shutdown || config.on_complete == OnComplete::Shutdown,
    };
    let events = orchestrator.start(&session.file.queue, options)?;

    let state = orchestrator.state();
    let watcher = thread::Builder::new()
        .name(String::from("renderq-stdin"))
        .spawn(move || watch_stdin(&state, || shutdown_handle.cancel()));
    if let Err(error) = watcher {
        tracing::warn!(%error, "stdin watcher unavailable; stop with Ctrl-C");
    } else {
        eprintln!("Rendering. Type q and Enter to stop.");
    }

    let mut last_frame = None;
    for event in events {
        print_event(&event, &mut last_frame);
    }
    let summary = orchestrator.wait()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if record {
        let path = record_path(&session.queue_path);
        summary.write(&path)?;
        println!("Run record: {}", path.display());
    }
    Ok(exit_code(&summary))
}

fn watch_stdin(state: &SharedRunState, cancel_shutdown: impl Fn()) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().eq_ignore_ascii_case("q") {
            cancel_shutdown();
            if state.request_stop() {
                tracing::info!("stop requested");
            }
        }
    }
}

fn print_event(event: &RunEvent, last_frame: &mut Option<(usize, usize)>) {
    match event {
        RunEvent::StatusChanged(status) => eprintln!("status: {status}"),
        RunEvent::ProjectStarted { index, file } => match index {
            Some(index) => eprintln!("project #{index}: {}", file.display()),
            None => eprintln!("project: {}", file.display()),
        },
        RunEvent::Progress(snapshot) => {
            let counters = (snapshot.global_frame, snapshot.project_frame);
            if *last_frame != Some(counters) {
                *last_frame = Some(counters);
                eprintln!(
                    "frame {}/{} (project {}/{})",
                    snapshot.global_frame,
                    snapshot.global_frames,
                    snapshot.project_frame,
                    snapshot.project_frames
                );
            }
        }
        RunEvent::FrameSaved { path } => eprintln!("saved {}", path.display()),
        RunEvent::UnsavedFrame { frame, removed } => match removed {
            Some(path) => eprintln!("frame {frame} was not saved; removed {}", path.display()),
            None => eprintln!("frame {frame} was not saved"),
        },
        RunEvent::Eta(text) => eprintln!("{text}"),
        RunEvent::Log(message) => eprintln!("{message}"),
        RunEvent::Error { kind, message } => eprintln!("error [{kind}]: {message}"),
        RunEvent::Finished => eprintln!("render finished"),
        RunEvent::Stopped => eprintln!("render stopped"),
    }
}

fn record_path(queue_path: &Path) -> PathBuf {
    let stem = queue_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("queue");
    queue_path.with_file_name(format!("{stem}.last_run.json"))
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    match summary.outcome {
        RunOutcome::Aborted => ExitCode::from(2),
        RunOutcome::Finished | RunOutcome::Stopped => ExitCode::SUCCESS,
    }
}

fn print_report(verb: &str, report: &LoadReport) {
    for file in &report.added {
        println!("{verb} {}", file.display());
    }
    for (file, reason) in &report.skipped {
        eprintln!("Skipped {}: {reason}", file.display());
    }
    if report.cache_hits > 0 {
        tracing::debug!(cache_hits = report.cache_hits, "metadata served from cache");
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
