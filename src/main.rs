use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use printdesk::api::graphql::FileUpload;
use printdesk::api::template_files::{CreateTemplateFileInput, UpdateTemplateFileInput};
use printdesk::api::template_types::{
    CommonFilter, CreateTemplateTypeInput, PageOptions, RequestOptions, TemplateTypesFilter,
    UpdateTemplateTypeInput, DEFAULT_PAGE_SIZE,
};
use printdesk::api::ApiClient;
use printdesk::config::{AppConfig, LogFormat};
use printdesk::loadtest::report::format_stats;
use printdesk::loadtest::UserId;
use printdesk::service_config::{config_tree, render_tree};
use printdesk::LoadTestOptions;

#[derive(Parser)]
#[command(
    name = "printdesk",
    about = "Administer print templates and load-test the print service",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $PRINTDESK_CONFIG, then /etc/printdesk/printdesk.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print service base URL, overriding the config file
    #[arg(long, global = true, env = "PRINTDESK_API")]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage template types
    Types {
        #[command(subcommand)]
        action: TypesAction,
    },

    /// Manage template files
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Show the public service configuration
    Config {
        /// Print the raw JSON instead of the tree
        #[arg(long)]
        json: bool,
    },

    /// Fire randomized print requests and track their completion
    LoadTest {
        /// Upper bound of the random delay between requests, in seconds (5-60)
        #[arg(long)]
        window: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Use a fixed user id instead of a random one
        #[arg(long)]
        user_id: Option<u32>,

        /// Wait for a `start` command instead of starting when ready
        #[arg(long)]
        manual: bool,

        /// Ignore stdin commands
        #[arg(long)]
        no_input: bool,

        /// JSON lines output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TypesAction {
    /// List template types
    List {
        /// Search in titles
        #[arg(long)]
        search: Option<String>,

        /// Include inactive template types
        #[arg(long)]
        all: bool,

        /// Only these owners (repeatable)
        #[arg(long = "owner")]
        owners: Vec<String>,

        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,

        /// Page size
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        size: u32,

        #[arg(long)]
        json: bool,
    },

    /// Show one template type with its files
    Show {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Create a template type
    Create {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        title: String,
    },

    /// Update a template type
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// Set the active flag (true/false)
        #[arg(long)]
        active: Option<bool>,
    },

    /// Remove a template type
    Remove { id: String },
}

#[derive(Subcommand)]
enum FilesAction {
    /// Upload a new file for a template type
    Upload {
        /// Template type id
        #[arg(long = "type")]
        template_type: String,

        /// File to upload
        path: PathBuf,

        /// Title, defaults to the file name
        #[arg(long)]
        title: Option<String>,

        /// Make it the current file of its template type
        #[arg(long)]
        current: bool,
    },

    /// Update a template file
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// Set whether this is the current file of its type (true/false)
        #[arg(long)]
        current: Option<bool>,
    },

    /// Download the stored content of a template file
    Download {
        id: String,

        /// Destination, defaults to the name the service reports
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Remove a template file
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configured subscriber depends on the file, so warnings raised while
    // locating it go through a plain stderr one.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .finish();
    let mut config =
        tracing::subscriber::with_default(bootstrap, || AppConfig::resolve(cli.config.as_deref()))?;
    if let Some(api) = cli.api {
        config.api.base_url = api;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Types { action } => run_types(&client(&config)?, action).await?,
        Commands::Files { action } => run_files(&client(&config)?, action).await?,
        Commands::Config { json } => {
            let raw = client(&config)?
                .service_config_raw()
                .await
                .context("failed to fetch service configuration")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&raw)?);
            } else {
                println!("\nService configuration ({})", config.api.base_url);
                print!("{}", render_tree(&config_tree(&raw)));
            }
        }
        Commands::LoadTest {
            window,
            duration,
            user_id,
            manual,
            no_input,
            json,
        } => {
            let opts = LoadTestOptions {
                window_secs: window,
                duration: duration.map(Duration::from_secs),
                user_id: user_id.map(UserId::new),
                json,
                manual,
                interactive: !no_input,
            };
            let stats = printdesk::run_load_test(&config, opts).await?;
            if json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("\n{}", format_stats(&stats));
            }
        }
    }

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn client(config: &AppConfig) -> Result<ApiClient> {
    ApiClient::new(config.api.base_url.clone(), config.api.timeout())
        .context("failed to build API client")
}

async fn run_types(client: &ApiClient, action: TypesAction) -> Result<()> {
    match action {
        TypesAction::List {
            search,
            all,
            owners,
            page,
            size,
            json,
        } => {
            let filter = TemplateTypesFilter {
                common: search.map(|s| CommonFilter { search: Some(s) }),
                active: if all { None } else { Some(true) },
                owners: if owners.is_empty() { None } else { Some(owners) },
            };
            let window = PageOptions::page(page.max(1), size)
                .with_context(|| format!("page {page} of size {size} is out of range"))?;
            let options = RequestOptions { page: Some(window) };
            let result = client.find_template_types(&filter, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!("{:<24} | {:<12} | {:<30} | {:<6} | Current file", "ID", "Owner", "Title", "Active");
            println!("{:-<24}-|-{:-<12}-|-{:-<30}-|-{:-<6}-|-{:-<30}", "", "", "", "", "");
            for t in &result.items {
                println!(
                    "{:<24} | {:<12} | {:<30} | {:<6} | {}",
                    t.id,
                    t.owner,
                    t.title,
                    if t.active { "yes" } else { "no" },
                    t.current_file.as_ref().map(|f| f.title.as_str()).unwrap_or("-")
                );
            }
            println!(
                "\npage {} of {} ({} total)",
                page.max(1),
                result.page_count(size).max(1),
                result.total
            );
        }
        TypesAction::Show { id, json } => {
            let Some(t) = client.template_type(&id).await? else {
                anyhow::bail!("template type {id} not found");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&t)?);
                return Ok(());
            }
            println!("{} ({})", t.title, t.id);
            println!("owner:  {}", t.owner);
            println!("active: {}", if t.active { "yes" } else { "no" });
            println!("\n{:<24} | {:<30} | {:<7} | Updated", "File", "Title", "Current");
            println!("{:-<24}-|-{:-<30}-|-{:-<7}-|-{:-<20}", "", "", "", "");
            for f in &t.page_of_files.items {
                println!(
                    "{:<24} | {:<30} | {:<7} | {}",
                    f.id,
                    f.title,
                    if f.is_current_file_of_its_type { "*" } else { "" },
                    f.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} file(s)", t.page_of_files.total);
        }
        TypesAction::Create { owner, title } => {
            let id = client
                .create_template_type(&CreateTemplateTypeInput { owner, title })
                .await?;
            println!("created template type {id}");
        }
        TypesAction::Update { id, title, active } => {
            let input = UpdateTemplateTypeInput { title, active };
            if input.is_empty() {
                anyhow::bail!("nothing to update: pass --title and/or --active");
            }
            if input.active == Some(true) {
                let current = client
                    .template_type(&id)
                    .await?
                    .with_context(|| format!("template type {id} not found"))?;
                current.can_activate()?;
            }
            let id = client.update_template_type(&id, &input).await?;
            println!("updated template type {id}");
        }
        TypesAction::Remove { id } => {
            let id = client.remove_template_type(&id).await?;
            println!("removed template type {id}");
        }
    }
    Ok(())
}

async fn run_files(client: &ApiClient, action: FilesAction) -> Result<()> {
    match action {
        FilesAction::Upload {
            template_type,
            path,
            title,
            current,
        } => {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            let mut file = FileUpload::from_path(&path).await?;
            match client.service_config().await {
                Ok(service) => {
                    let Some(file_type) = service.file_type(ext) else {
                        anyhow::bail!(
                            "the service does not accept .{ext} files (allowed: {})",
                            service
                                .allowed_file_types
                                .iter()
                                .map(|t| t.extension.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                    };
                    file = file.with_mime(file_type.mime.clone());
                }
                Err(e) => tracing::warn!(error = %e, mime = %file.mime, "cannot check allowed file types"),
            }
            let input = CreateTemplateFileInput {
                template_type_id: template_type,
                title: title.unwrap_or_else(|| file.file_name.clone()),
                is_current_file_of_its_type: current,
            };
            let created = client.create_template_file(file, &input).await?;
            println!(
                "uploaded file {} to template type {}",
                created.id, created.template_type.id
            );
        }
        FilesAction::Update { id, title, current } => {
            let input = UpdateTemplateFileInput {
                title,
                is_current_file_of_its_type: current,
            };
            if input.is_empty() {
                anyhow::bail!("nothing to update: pass --title and/or --current");
            }
            let updated = client.update_template_file(&id, &input).await?;
            println!("updated file {} ({})", updated.id, updated.title);
        }
        FilesAction::Download { id, out } => {
            let raw = client.download_template_file(&id).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(raw.file_name.as_deref().unwrap_or(&id)));
            tokio::fs::write(&path, &raw.bytes)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!(
                "saved {} bytes ({}) to {}",
                raw.bytes.len(),
                raw.content_type.as_deref().unwrap_or("unknown type"),
                path.display()
            );
        }
        FilesAction::Remove { id } => {
            let removed = client.remove_template_file(&id).await?;
            println!(
                "removed file {} from template type {}",
                removed.id, removed.template_type.id
            );
        }
    }
    Ok(())
}
