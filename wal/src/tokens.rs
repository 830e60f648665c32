//! Persistence of ring tokens alongside the WAL.
//!
//! Tokens live next to the segment directories so that an ingester replaying
//! its WAL after a restart rejoins the ring at the same position, keeping
//! key ownership stable across the restart.

use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    MalformedTokensSnafu, Result, UnableToReadTokensSnafu, UnableToWriteTokensSnafu,
};

const TOKENS_FILE: &str = "tokens.json";

#[derive(Debug, Serialize, Deserialize)]
struct TokensFile {
    tokens: Vec<u32>,
}

/// Load previously persisted ring tokens from `wal_root`, if any.
pub async fn load_tokens(wal_root: &Path) -> Result<Option<Vec<u32>>> {
    let path = wal_root.join(TOKENS_FILE);
    let contents = match tokio::fs::read(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).context(UnableToReadTokensSnafu { path });
        }
    };
    let parsed: TokensFile =
        serde_json::from_slice(&contents).context(MalformedTokensSnafu { path })?;
    Ok(Some(parsed.tokens))
}

/// Persist ring tokens to `wal_root`, replacing any previous set atomically.
pub async fn store_tokens(wal_root: &Path, tokens: &[u32]) -> Result<()> {
    let path = wal_root.join(TOKENS_FILE);
    let tmp = wal_root.join(format!("{TOKENS_FILE}.tmp"));

    let contents = serde_json::to_vec_pretty(&TokensFile {
        tokens: tokens.to_vec(),
    })
    .expect("token serialisation is infallible");

    tokio::fs::write(&tmp, contents)
        .await
        .context(UnableToWriteTokensSnafu { path: tmp.clone() })?;
    tokio::fs::rename(&tmp, &path)
        .await
        .context(UnableToWriteTokensSnafu { path })?;
    Ok(())
}
