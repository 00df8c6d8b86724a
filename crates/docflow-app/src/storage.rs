//! Shared LMDB environment helpers for the record and checkpoint stores.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use crate::paths::{PathError, ensure_dir};

const ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const ENV_MAX_DBS: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
}

/// Open (or create) the LMDB environment at `dir`.
///
/// Records and checkpoints share one environment; clone the returned handle
/// instead of opening the same directory twice.
pub fn open_env(dir: &Path) -> Result<Env, StorageError> {
    let dir = ensure_dir(dir)?;
    let mut options = EnvOpenOptions::new();
    options.max_dbs(ENV_MAX_DBS);
    options.map_size(ENV_MAP_SIZE_BYTES);
    let env = unsafe {
        // SAFETY: the environment is opened once per directory and shared by handle.
        options.open(&dir)?
    };
    Ok(env)
}

/// Open the named database, creating it on first use.
pub(crate) fn open_or_create_db(env: &Env, name: &str) -> Result<Database<Str, Bytes>, heed::Error> {
    debug_assert!(!name.is_empty());
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<Str, Bytes>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}
