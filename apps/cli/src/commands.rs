use crate::args::Command;
use anyhow::{Context, bail};
use lumen_storage::{
    FileInfo, FileStorage, MetadataOverrides, Payload, StorageConfig, StorageManager,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Initializes storage from `config` and executes `command`, writing results to stdout.
///
/// # Errors
/// Storage, I/O and lookup failures, with context.
pub async fn run(command: Command, config: StorageConfig) -> anyhow::Result<()> {
    let manager = StorageManager::new(config);
    let storage = manager.initialize().await.context("No storage backend is usable")?;
    info!(backend = %storage.storage_type(), "Storage ready");

    let mut out = std::io::stdout().lock();
    execute(&manager, &storage, command, &mut out).await
}

/// Executes `command` against an initialized manager, writing results to `out`.
///
/// # Errors
/// See [`run`].
pub async fn execute(
    manager: &StorageManager,
    storage: &Arc<dyn FileStorage>,
    command: Command,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        Command::Put { path, id, name, mime, thumbnail } => {
            let (id, payload, overrides) = read_upload(&path, id, name, mime).await?;
            if thumbnail {
                let stored = manager.store_with_thumbnail(&id, payload, overrides).await?;
                writeln!(out, "{}", stored.uri)?;
                if stored.thumbnail.is_none() {
                    writeln!(out, "(no thumbnail)")?;
                }
            } else {
                writeln!(out, "{}", storage.save_file(&id, payload, overrides).await?)?;
            }
        },
        Command::Get { id, out: target } => {
            let payload = storage.get_file(&id).await?.with_context(|| format!("No file {id:?}"))?;
            tokio::fs::write(&target, &payload.bytes)
                .await
                .with_context(|| format!("Writing {}", target.display()))?;
            debug!(id, bytes = payload.len(), target = %target.display(), "File exported");
        },
        Command::Url { id } => {
            let url = storage.get_file_url(&id).await?.with_context(|| format!("No file {id:?}"))?;
            writeln!(out, "{url}")?;
        },
        Command::Ls { json } => {
            let files = storage.list_files().await?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &files)?;
                writeln!(out)?;
            } else {
                write_table(out, &files)?;
            }
        },
        Command::Rm { id } => storage.delete_file(&id).await?,
        Command::Usage => {
            let usage = storage.storage_usage().await?;
            writeln!(out, "backend:   {}", storage.storage_type())?;
            writeln!(out, "used:      {} bytes", usage.used)?;
            match usage.available {
                Some(available) => writeln!(out, "available: {available} bytes")?,
                None => writeln!(out, "available: unknown")?,
            }
        },
        Command::Clear => storage.clear_all().await?,
        Command::Fetch { url, id } => {
            let report = |loaded: u64, total: u64| debug!(loaded, total, "Downloading");
            let uri = manager
                .downloader()
                .download_and_store(storage.as_ref(), &url, &id, Some(&report))
                .await?;
            writeln!(out, "{uri}")?;
        },
        Command::Resolve { url } => match manager.resolve_url(&url).await? {
            Some(resolved) => writeln!(out, "{resolved}")?,
            None => bail!("Nothing stored at {url}"),
        },
    }

    Ok(())
}

async fn read_upload(
    path: &Path,
    id: Option<String>,
    name: Option<String>,
    mime: Option<String>,
) -> anyhow::Result<(String, Payload, MetadataOverrides)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_owned();

    let bytes =
        tokio::fs::read(path).await.with_context(|| format!("Reading {}", path.display()))?;

    let payload = match mime {
        Some(mime) => Payload::typed(bytes, mime),
        None => Payload::guessed(bytes, &file_name),
    };
    let overrides = MetadataOverrides::default().name(name.unwrap_or_else(|| file_name.clone()));

    Ok((id.unwrap_or(file_name), payload, overrides))
}

fn write_table(out: &mut impl Write, files: &[FileInfo]) -> std::io::Result<()> {
    let width = files.iter().map(|f| f.id.len()).max().unwrap_or(2).max(2);
    writeln!(out, "{:<width$}  {:>12}  {:<24}  CREATED", "ID", "SIZE", "TYPE")?;
    for file in files {
        let meta = &file.metadata;
        writeln!(
            out,
            "{:<width$}  {:>12}  {:<24}  {}",
            file.id,
            meta.size,
            meta.mime_type,
            meta.created_at.format("%Y-%m-%d %H:%M:%S")
        )?;
    }
    Ok(())
}
