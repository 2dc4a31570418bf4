//! taskcells CLI entry point.
//!
//! Drives the taskcells core against a live Jupyter kernel and an `.ipynb`
//! file: browse the task catalog, convert cells into task widgets, and
//! restore widget cells after a reload.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use taskcells::config::{load_settings, settings_path};
use taskcells::conversion::{ConfirmDialog, ConversionOutcome};
use taskcells::library;
use taskcells::notebook::NotebookHost;
use taskcells::picker::TaskPicker;
use taskcells::{
    classify, AutoAnswer, Extension, KernelChannel, NotebookDocument, OverwritePrompt, Settings,
    Task,
};

#[derive(Parser, Debug)]
#[command(name = "taskcells")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Connect to a running kernel through its connection file
    #[arg(long, global = true)]
    connection_file: Option<PathBuf>,

    /// Kernelspec to launch when no connection file is given
    #[arg(long, global = true, default_value = "python3")]
    kernel: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the tasks the kernel offers, grouped by library
    Catalog {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Compile a directory of task library files without a kernel
    Compile {
        /// Library directory (default: library_dir from settings)
        dir: Option<PathBuf>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Also write COMPILED_TASKS.json into the directory
        #[arg(long)]
        record: bool,
    },
    /// Show how each cell of a notebook is classified
    Classify {
        notebook: PathBuf,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Re-run widget cells and hide marked cells, then save the notebook
    Restore {
        notebook: PathBuf,
        /// Write to this path instead of overwriting the notebook
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Convert a cell into a task widget (or re-run it when no task is given)
    Convert {
        notebook: PathBuf,
        /// Zero-based index of the cell to convert
        #[arg(long)]
        cell: usize,
        /// Task label from the catalog
        #[arg(long)]
        task: Option<String>,
        /// Overwrite user-authored cells without asking
        #[arg(long, short)]
        yes: bool,
        /// Write to this path instead of overwriting the notebook
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the settings file location and current values
    Config,
}

#[derive(Tabled)]
struct TaskTableRow {
    #[tabled(rename = "LIBRARY")]
    library: String,
    #[tabled(rename = "TASK")]
    name: String,
    #[tabled(rename = "ARGS")]
    args: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl From<&Task> for TaskTableRow {
    fn from(task: &Task) -> Self {
        let args = task
            .required_args
            .iter()
            .map(|a| a.name.clone())
            .chain(task.optional_args.iter().map(|a| format!("[{}]", a.name)))
            .collect::<Vec<_>>()
            .join(", ");
        TaskTableRow {
            library: task.library_name.to_uppercase(),
            name: task.name.clone(),
            args: if args.is_empty() { "-".to_string() } else { args },
            description: truncate(&task.description, 60),
        }
    }
}

#[derive(Tabled, Serialize)]
struct CellTableRow {
    #[tabled(rename = "INDEX")]
    index: usize,
    #[tabled(rename = "TYPE")]
    cell_type: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "HIDDEN")]
    hidden: bool,
    #[tabled(rename = "FIRST LINE")]
    first_line: String,
}

/// Truncate text for display, replacing newlines with spaces.
fn truncate(text: &str, max_len: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_len {
        single_line
    } else {
        let cut: String = single_line.chars().take(max_len - 3).collect();
        format!("{}...", cut)
    }
}

/// Asks on the terminal before overwriting a cell.
struct StdinPrompt;

impl OverwritePrompt for StdinPrompt {
    fn confirm_overwrite<'a>(
        &'a self,
        dialog: &'a ConfirmDialog,
    ) -> futures::future::BoxFuture<'a, bool> {
        let dialog = dialog.clone();
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || {
                let mut stdout = std::io::stdout();
                let _ = writeln!(stdout, "{}\n{}", dialog.title, dialog.body);
                let _ = write!(
                    stdout,
                    "[{}/{}] (y/N): ",
                    dialog.accept_label, dialog.cancel_label
                );
                let _ = stdout.flush();
                let mut line = String::new();
                match std::io::stdin().lock().read_line(&mut line) {
                    Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
                    Err(_) => false,
                }
            })
            .await;
            answer.unwrap_or(false)
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = load_settings();

    match cli.command {
        Commands::Catalog { json } => {
            let channel = Arc::new(connect(&cli.connection_file, &cli.kernel).await?);
            let picker = catalog_session(&channel, settings).open_picker().await?;
            print_catalog(&picker, json)?;
            finish(channel).await
        }
        Commands::Compile { dir, json, record } => compile(dir, &settings, json, record),
        Commands::Classify { notebook, json } => classify_cells(&notebook, &settings, json),
        Commands::Restore { notebook, output } => {
            let doc = NotebookDocument::load(&notebook)?;
            let channel = Arc::new(connect(&cli.connection_file, &cli.kernel).await?);
            let host = Arc::new(StdMutex::new(doc));
            let ext = Extension::new(
                channel.clone(),
                host.clone(),
                Arc::new(AutoAnswer(false)),
                settings,
            );

            let report = ext.initialize().await?;
            println!(
                "Restored {} widget cells, hid {} cells ({} aborted)",
                report.converted, report.hidden, report.aborted
            );
            drop(ext);
            save(&host, output.as_deref())?;
            finish(channel).await
        }
        Commands::Convert {
            notebook,
            cell,
            task,
            yes,
            output,
        } => {
            let doc = NotebookDocument::load(&notebook)?;
            let target = doc
                .cell_at(cell)
                .map(|v| v.cell_ref())
                .ok_or_else(|| anyhow::anyhow!("Notebook has no cell at index {}", cell))?;
            let channel = Arc::new(connect(&cli.connection_file, &cli.kernel).await?);
            let host = Arc::new(StdMutex::new(doc));
            let prompt: Arc<dyn OverwritePrompt> = if yes {
                Arc::new(AutoAnswer(true))
            } else {
                Arc::new(StdinPrompt)
            };
            let ext = Extension::new(channel.clone(), host.clone(), prompt, settings);
            ext.initialize().await?;

            let report = match task {
                Some(label) => {
                    let mut picker = ext.open_picker().await?;
                    let index = picker
                        .tasks()
                        .iter()
                        .position(|t| t.name == label)
                        .ok_or_else(|| anyhow::anyhow!("Unknown task: {}", label))?;
                    picker.select(index);
                    ext.apply_picker_choice(&picker, Some(target)).await?
                }
                None => ext.converter().convert(&target, None).await,
            };
            drop(ext);

            match report.outcome {
                ConversionOutcome::Hidden => {
                    println!("Converted cell {}", cell);
                    save(&host, output.as_deref())?;
                }
                ConversionOutcome::Aborted(reason) => println!("Conversion aborted: {}", reason),
            }
            finish(channel).await
        }
        Commands::Config => {
            println!("{}", settings_path().display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn connect(connection_file: &Option<PathBuf>, kernel: &str) -> Result<KernelChannel> {
    match connection_file {
        Some(path) => KernelChannel::from_connection_file(path).await,
        None => KernelChannel::launch(kernel).await,
    }
}

/// Session over a scratch notebook, used when only the kernel matters.
fn catalog_session(
    channel: &Arc<KernelChannel>,
    settings: Settings,
) -> Extension<KernelChannel, NotebookDocument> {
    Extension::new(
        channel.clone(),
        Arc::new(StdMutex::new(NotebookDocument::new_empty())),
        Arc::new(AutoAnswer(false)),
        settings,
    )
}

/// Shut the kernel down if this process launched it.
async fn finish(channel: Arc<KernelChannel>) -> Result<()> {
    if let Ok(mut channel) = Arc::try_unwrap(channel) {
        channel.shutdown().await?;
    }
    Ok(())
}

fn save(host: &Arc<StdMutex<NotebookDocument>>, output: Option<&Path>) -> Result<()> {
    let mut doc = host.lock().unwrap_or_else(|e| e.into_inner());
    doc.save(output)?;
    if let Some(path) = &doc.path {
        info!("Saved {}", path.display());
    }
    Ok(())
}

fn print_catalog(picker: &TaskPicker, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(picker.tasks())?);
        return Ok(());
    }
    if picker.tasks().is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    let rows: Vec<TaskTableRow> = picker.tasks().iter().map(TaskTableRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn compile(dir: Option<PathBuf>, settings: &Settings, json: bool, record: bool) -> Result<()> {
    let dir = dir
        .or_else(|| settings.library_dir.clone())
        .ok_or_else(|| anyhow::anyhow!("No library directory given and none in settings"))?;
    let tasks = library::compile_dir(&dir)?;

    if record {
        let path = library::write_record(&dir, &tasks)?;
        info!("Wrote {}", path.display());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&library::to_catalog_json(&tasks))?
        );
    } else {
        print_catalog(&TaskPicker::open(tasks), false)?;
    }
    Ok(())
}

fn classify_cells(notebook: &Path, settings: &Settings, json: bool) -> Result<()> {
    let doc = NotebookDocument::load(notebook)?;
    let markers = settings.markers();
    let rows: Vec<CellTableRow> = doc
        .cells()
        .into_iter()
        .map(|view| CellTableRow {
            index: view.index,
            cell_type: view.cell_type.to_string(),
            class: classify(&view.source, Some(&view.tag), &markers).to_string(),
            hidden: view.tag.input_hidden,
            first_line: truncate(view.source.lines().next().unwrap_or(""), 50),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("Notebook has no cells.");
    } else {
        let table = Table::new(rows).with(Style::rounded()).to_string();
        println!("{}", table);
    }
    Ok(())
}
