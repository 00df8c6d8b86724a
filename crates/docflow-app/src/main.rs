use std::{process, sync::Arc, time::Duration};

use bytes::Bytes;
use serde_json::json;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt};

use docflow_app::cli::{
    Cli, Commands, ConsumeArgs, EnqueueArgs, ExtractArgs, RecordsArgs, RecordsCommands,
};
use docflow_app::config::{self, AppConfig};
use docflow_app::error::AppError;
use docflow_app::events::{
    CheckpointStore, EventBody, LmdbCheckpointStore, SpoolEventSource, SpoolWriter,
};
use docflow_app::server::{self, ApiState};
use docflow_app::services::{
    BatchConsumer, DocStatus, ExtractionClient, HttpExtractionClient, HttpNotifier,
    LmdbRecordStore, RecordStore, RetryPolicy, build_fetcher,
};
use docflow_app::storage::open_env;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Consume(_)) | Some(Commands::Serve) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Consume(args)) => run_consume(args).await?,
        Some(Commands::Serve) => run_serve().await?,
        Some(Commands::Extract(args)) => run_extract(args).await?,
        Some(Commands::Enqueue(args)) => run_enqueue(args).await?,
        Some(Commands::Records(args)) => run_records(args).await?,
        Some(Commands::Checkpoints) => run_checkpoints().await?,
        None => Cli::print_help(),
    }
    Ok(())
}

struct Stores {
    records: Arc<LmdbRecordStore>,
    checkpoints: Arc<LmdbCheckpointStore>,
}

impl Stores {
    fn open(cfg: &AppConfig) -> Result<Self, AppError> {
        let env = open_env(&cfg.records.connection)?;
        let records = LmdbRecordStore::open(&env, &cfg.records.collection)?;
        let checkpoints = LmdbCheckpointStore::open(
            &env,
            &cfg.checkpoint.container,
            &cfg.stream.name,
            &cfg.stream.consumer_group,
        )?;
        tracing::debug!(path = ?cfg.records.connection, "opened LMDB stores");
        Ok(Self {
            records: Arc::new(records),
            checkpoints: Arc::new(checkpoints),
        })
    }

    fn api_state(&self) -> ApiState {
        ApiState {
            records: self.records.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }
}

async fn run_consume(args: ConsumeArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    cfg.validate_for_consumer()?;
    let stores = Stores::open(&cfg)?;

    let consumer = BatchConsumer::builder()
        .source(Arc::new(SpoolEventSource::new(cfg.stream.connection.clone())))
        .checkpoints(stores.checkpoints.clone())
        .fetcher(build_fetcher(&cfg.storage).await?)
        .extractor(Arc::new(HttpExtractionClient::from_config(&cfg.extraction)?))
        .records(stores.records.clone())
        .notifier(Arc::new(HttpNotifier::from_config(&cfg.downstream)?))
        .retry(RetryPolicy::from_config(&cfg.retry))
        .bucket(cfg.storage.bucket.clone())
        .max_batch_size(cfg.stream.max_event_batch_size)
        .poll_interval(Duration::from_millis(cfg.stream.poll_interval_ms))
        .build();

    if args.drain {
        if args.serve {
            tracing::warn!("--serve is ignored together with --drain");
        }
        let summary = consumer.run_until_idle().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let shutdown = server::spawn_shutdown_listener();
    let server_task = if args.serve {
        let server_cfg = cfg.clone();
        let state = stores.api_state();
        let rx = shutdown.clone();
        Some(tokio::spawn(async move {
            server::serve(&server_cfg, state, rx).await
        }))
    } else {
        None
    };

    let result = consumer.run(shutdown).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "consumer stopped on a fatal stream error");
    }

    if let Some(task) = server_task {
        if result.is_err() {
            task.abort();
        } else {
            match task.await {
                Ok(served) => served?,
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => return Err(AppError::Task(join_err.to_string())),
            }
        }
    }
    result?;
    Ok(())
}

async fn run_serve() -> Result<(), AppError> {
    let cfg = config::load()?;
    let stores = Stores::open(&cfg)?;
    let shutdown = server::spawn_shutdown_listener();
    server::serve(&cfg, stores.api_state(), shutdown).await?;
    Ok(())
}

async fn run_extract(args: ExtractArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    cfg.validate_retry()?;
    let data = tokio::fs::read(&args.input)
        .await
        .map_err(|source| AppError::Io {
            path: args.input.clone(),
            source,
        })?;
    let file_name = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let client = HttpExtractionClient::from_config(&cfg.extraction)?;
    let policy = RetryPolicy::from_config(&cfg.retry);
    let data = Bytes::from(data);
    let result = policy
        .run("extract", || client.extract(&file_name, data.clone()))
        .await?;
    let doc_status = DocStatus::from_result(result.as_ref());

    let output = json!({
        "file_name": file_name,
        "doc_status": doc_status,
        "extracted_details": result,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_enqueue(args: EnqueueArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let writer = SpoolWriter::new(cfg.stream.connection.clone());
    let body = EventBody {
        event_id: args.event_id,
        doc_id: args.doc_id,
        file_name: args.file_name,
        uid: args.uid,
    };
    let offset = writer.append(&args.partition, &body).await?;
    println!(
        "{}",
        json!({ "partition": args.partition, "offset": offset, "doc_id": body.doc_id })
    );
    Ok(())
}

async fn run_records(args: RecordsArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let stores = Stores::open(&cfg)?;
    match args.command {
        RecordsCommands::Get { document_id } => {
            let record = stores
                .records
                .get(&document_id)
                .await?
                .ok_or(AppError::DocumentNotFound(document_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RecordsCommands::List { status, limit } => {
            for record in stores.records.list_by_status(status, limit).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }
    Ok(())
}

async fn run_checkpoints() -> Result<(), AppError> {
    let cfg = config::load()?;
    let stores = Stores::open(&cfg)?;
    let states = stores.checkpoints.list().await?;
    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}
