//! Content-addressed cache for model responses
//!
//! Responses are keyed by a SHA-256 hash over the stable prompt content, the
//! variable query, the model name, and the max-token budget. Entries store
//! only the response string; the key already identifies the full request.
//!
//! An optional "old" cache file can be consolidated: it is read as a
//! fallback and its hits are promoted into the main cache, but it is never
//! written back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::util::write_atomic;

/// One cached response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub response: String,
}

/// Derive the cache key for a request.
pub fn cache_key(stable: &str, variable: &str, model: &str, max_tokens: u32) -> String {
    let request = format!(
        "{stable}\n\n---QUERY---\n\n{variable}\n\n---MODEL---\n\n{model}\n\n---MAX_TOKENS---\n\n{max_tokens}"
    );
    let mut hasher = Sha256::new();
    hasher.update(request.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Persistent response cache backed by a JSON file.
#[derive(Debug)]
pub struct ApiCache {
    cache_file: PathBuf,
    cache: BTreeMap<String, CacheEntry>,
    old_cache: BTreeMap<String, CacheEntry>,
}

impl ApiCache {
    /// Open (or create) the cache at `cache_file`. When `old_cache_file` is
    /// `None`, sibling files matching `api_cache_*.json` are auto-detected
    /// for consolidation.
    pub fn open(cache_file: &Path, old_cache_file: Option<&Path>) -> Result<Self> {
        let cache = Self::load_main(cache_file)?;

        let old_path = match old_cache_file {
            Some(p) => Some(p.to_path_buf()),
            None => Self::detect_old_cache(cache_file),
        };
        let old_cache = match &old_path {
            Some(path) => {
                let entries = Self::load_old(path);
                if !entries.is_empty() {
                    tracing::info!(
                        entries = entries.len(),
                        path = %path.display(),
                        "loaded old cache file for consolidation"
                    );
                }
                entries
            }
            None => BTreeMap::new(),
        };

        Ok(Self {
            cache_file: cache_file.to_path_buf(),
            cache,
            old_cache,
        })
    }

    fn detect_old_cache(cache_file: &Path) -> Option<PathBuf> {
        let dir = cache_file.parent().filter(|p| !p.as_os_str().is_empty())?;
        let main_name = cache_file.file_name()?.to_string_lossy().into_owned();

        let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .flatten()
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with("api_cache_") && name.ends_with(".json") && name != main_name
            })
            .map(|entry| entry.path())
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    /// Load the main cache. A parse failure backs the file up and aborts:
    /// a corrupt cache must never be overwritten.
    fn load_main(path: &Path) -> Result<BTreeMap<String, CacheEntry>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(map) => Ok(map),
            Err(e) => {
                let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                let backup = path.with_file_name(format!(
                    "{}.corrupted.{timestamp}.bak",
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "api_cache.json".to_string())
                ));
                match std::fs::copy(path, &backup) {
                    Ok(_) => {
                        eprintln!(
                            "ERROR: cache file {} is corrupted ({e}); backup saved to {}",
                            path.display(),
                            backup.display()
                        );
                    }
                    Err(backup_err) => {
                        eprintln!(
                            "ERROR: cache file {} is corrupted ({e}) AND backup failed ({backup_err}); back it up manually before proceeding",
                            path.display()
                        );
                    }
                }
                Err(Error::CorruptCache {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Load the old cache. Corruption here is tolerated with a warning.
    fn load_old(path: &Path) -> BTreeMap<String, CacheEntry> {
        if !path.exists() {
            return BTreeMap::new();
        }
        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|contents| {
            serde_json::from_str(&contents).map_err(|e| e.to_string())
        }) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = e,
                    "old cache file is unreadable; continuing without it"
                );
                BTreeMap::new()
            }
        }
    }

    /// Look up a cached response. Hits in the old cache are promoted into
    /// the main cache.
    pub fn get(
        &mut self,
        stable: &str,
        variable: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<Option<String>> {
        let key = cache_key(stable, variable, model, max_tokens);

        if let Some(entry) = self.cache.get(&key) {
            return Ok(Some(entry.response.clone()));
        }

        if let Some(entry) = self.old_cache.get(&key).cloned() {
            self.cache.insert(key, entry.clone());
            self.save()?;
            return Ok(Some(entry.response));
        }

        Ok(None)
    }

    /// Store a response. First write wins: an already-present key is never
    /// overwritten, which protects a verified good response from being
    /// clobbered by a later retry under the same key.
    pub fn insert(
        &mut self,
        stable: &str,
        variable: &str,
        model: &str,
        max_tokens: u32,
        response: &str,
    ) -> Result<()> {
        let key = cache_key(stable, variable, model, max_tokens);
        if self.cache.contains_key(&key) {
            return Ok(());
        }
        self.cache.insert(
            key,
            CacheEntry {
                response: response.to_string(),
            },
        );
        self.save()
    }

    /// Remove a specific entry. Returns whether anything was removed.
    pub fn remove(
        &mut self,
        stable: &str,
        variable: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<bool> {
        let key = cache_key(stable, variable, model, max_tokens);
        if self.cache.remove(&key).is_some() {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether a key is present in the main cache.
    pub fn contains(&self, stable: &str, variable: &str, model: &str, max_tokens: u32) -> bool {
        self.cache
            .contains_key(&cache_key(stable, variable, model, max_tokens))
    }

    /// Number of entries in the main cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.cache)?;
        write_atomic(&self.cache_file, &contents)
    }
}
