use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::image::{Image, ImageItem};

/// Directory name under the system temp directory.
const CACHE_DIR_NAME: &str = "BurnImageItemsCli";

/// Partition bodies are streamed out of the image in slices of this size.
const EXTRACT_CHUNK: usize = 4 * 1024 * 1024;

/// A partition asking for more tail padding than this is malformed.
const MAX_PADDING: u32 = 4096;

/// Content-addressed cache of extracted partition bodies.
///
/// Every partition becomes `<name>_0x<offset>.bin` with a `.sha256`
/// companion holding the lowercase hex digest of the content. If the
/// `(name, offset, sha256)` set on disk exactly matches a freshly parsed
/// partition table, the cache is trusted and the image body is not read
/// again; otherwise the directory is wiped and re-extracted.
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// The process-global default location, `<temp>/BurnImageItemsCli`.
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir().join(CACHE_DIR_NAME),
        }
    }

    /// A cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str, offset: u32) -> PathBuf {
        self.dir.join(format!("{}_0x{:08x}.bin", name, offset))
    }

    /// Reconstructs the key set from the files currently in the cache.
    /// Unparseable or companion-less files are skipped with a warning.
    fn scan(&self) -> Vec<CacheKey> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "bin") {
                continue;
            }
            let stem = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            let (name, offset) = match parse_bin_stem(&stem) {
                Some(parsed) => parsed,
                None => {
                    warn!("skipping invalid cache file {}", path.display());
                    continue;
                }
            };

            let sha256 = match fs::read_to_string(companion_path(&path)) {
                Ok(text) => match decode_sha256(text.trim()) {
                    Some(sha256) => sha256,
                    None => {
                        warn!("invalid digest file for {}", path.display());
                        continue;
                    }
                },
                Err(_) => {
                    warn!("no digest file for {}", path.display());
                    continue;
                }
            };

            keys.push(CacheKey {
                offset,
                name,
                sha256,
            });
        }

        keys.sort();
        keys
    }

    /// Empties the cache directory, creating it if necessary.
    fn wipe(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(err) = removed {
                warn!("failed to remove {}: {}", path.display(), err);
            }
        }
        Ok(())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of one cached partition body.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct CacheKey {
    offset: u32,
    name: String,
    sha256: [u8; 32],
}

/// Splits `<name>_0x<hex>` on the last `_0x`, so names containing `_0x`
/// themselves survive the round trip.
fn parse_bin_stem(stem: &str) -> Option<(String, u32)> {
    let pos = stem.rfind("_0x")?;
    let offset = u32::from_str_radix(&stem[pos + 3..], 16).ok()?;
    Some((stem[..pos].to_string(), offset))
}

fn companion_path(bin: &Path) -> PathBuf {
    let mut os = bin.as_os_str().to_os_string();
    os.push(".sha256");
    PathBuf::from(os)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_sha256(text: &str) -> Option<[u8; 32]> {
    if text.len() != 64 {
        return None;
    }
    let mut sha256 = [0u8; 32];
    for (i, byte) in sha256.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(sha256)
}

impl Image {
    /// Produces the burnable item list, extracting partition bodies into
    /// the cache or re-using it when its key set matches this image.
    pub fn items(&mut self, cache: &Cache) -> Result<Vec<ImageItem>> {
        let mut current: Vec<CacheKey> = self
            .partitions()
            .iter()
            .map(|part| CacheKey {
                offset: part.offset,
                name: part.name.clone(),
                sha256: part.content_sha256,
            })
            .collect();
        current.sort();

        if cache.scan() == current {
            debug!("cache matches image, re-using extracted partitions");
            self.items_from_cache(cache)
        } else {
            debug!("cache is stale, extracting partitions");
            cache.wipe()?;
            self.extract(cache)
        }
    }

    fn items_from_cache(&self, cache: &Cache) -> Result<Vec<ImageItem>> {
        let mut items = Vec::with_capacity(self.partitions().len());
        for part in self.partitions() {
            let path = cache.file_path(&part.name, part.offset);
            // scan() just saw these files; a miss here means the cache is
            // being modified underneath us
            fs::metadata(&path)?;
            items.push(ImageItem {
                name: part.name.clone(),
                offset: u64::from(part.offset),
                size: u64::from(part.max_size),
                erase_size: u64::from(part.erase_size),
                path,
                file_size: u64::from(part.size),
            });
        }
        Ok(items)
    }

    fn extract(&mut self, cache: &Cache) -> Result<Vec<ImageItem>> {
        let mut items = Vec::with_capacity(self.partitions().len());
        let mut buf = vec![0u8; EXTRACT_CHUNK];

        // self.partitions() borrows immutably while the file is read, so
        // iterate over a snapshot of the entries
        let parts = self.partitions().to_vec();
        for part in &parts {
            let path = cache.file_path(&part.name, part.offset);
            let mut out = File::create(&path)?;
            let mut hasher = Sha256::new();

            self.file.seek(SeekFrom::Start(u64::from(part.content_offset)))?;
            let mut remaining = part.content_size as usize;
            while remaining > 0 {
                let n = EXTRACT_CHUNK.min(remaining);
                self.file.read_exact(&mut buf[..n])?;
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])?;
                remaining -= n;
            }

            // The digest covers the content only, not the tail padding.
            let padding = part.size - part.content_size;
            if padding > MAX_PADDING {
                drop(out);
                let _ = fs::remove_file(&path);
                return Err(Error::protocol(format!(
                    "partition '{}' needs {} bytes of padding",
                    part.name, padding
                )));
            }
            out.write_all(&vec![0xFF; padding as usize])?;
            drop(out);

            let digest: [u8; 32] = hasher.finalize().into();
            if digest != part.content_sha256 {
                let _ = fs::remove_file(&path);
                return Err(Error::protocol(format!(
                    "sha-256 mismatch for partition '{}', {} != {}",
                    part.name,
                    hex_string(&digest),
                    hex_string(&part.content_sha256)
                )));
            }

            fs::write(companion_path(&path), hex_string(&digest))?;
            debug!("extracted partition '{}' to {}", part.name, path.display());

            items.push(ImageItem {
                name: part.name.clone(),
                offset: u64::from(part.offset),
                size: u64::from(part.max_size),
                erase_size: u64::from(part.erase_size),
                path,
                file_size: u64::from(part.size),
            });
        }

        Ok(items)
    }
}
