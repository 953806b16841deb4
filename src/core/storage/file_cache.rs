//! Bounded cache of open file handles, LRU-evicted and closed after a fixed
//! idle period.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Most handles kept open at once.
pub const DEFAULT_CAPACITY: usize = 50;

/// Handles untouched for this long are closed even when the cache has room.
pub const IDLE_LIMIT: Duration = Duration::from_secs(5 * 60);

struct CachedHandle {
    file: File,
    last_used: Instant,
}

/// The handle cache. The caller guards it with the storage mutex; holding
/// that lock across the actual read or write is what serializes per-file
/// access.
pub struct FileCache {
    capacity: usize,
    idle_limit: Duration,
    handles: HashMap<usize, CachedHandle>,
}

impl FileCache {
    #[must_use]
    pub fn new(capacity: usize, idle_limit: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            idle_limit,
            handles: HashMap::new(),
        }
    }

    /// Run `operation` against the cached handle for `file_index`, opening
    /// (and caching) the file first when necessary.
    ///
    /// With `create` false, a missing file surfaces as
    /// [`io::ErrorKind::NotFound`].
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or `operation` fails.
    pub fn with_file<R>(
        &mut self,
        file_index: usize,
        path: &Path,
        create: bool,
        operation: impl FnOnce(&mut File) -> io::Result<R>,
    ) -> io::Result<R> {
        self.close_idle();

        if !self.handles.contains_key(&file_index) {
            let file = OpenOptions::new().read(true).write(true).create(create).open(path)?;
            self.evict_to_fit();
            self.handles.insert(
                file_index,
                CachedHandle {
                    file,
                    last_used: Instant::now(),
                },
            );
        }

        let handle = self.handles.get_mut(&file_index).expect("handle was just inserted");
        handle.last_used = Instant::now();
        operation(&mut handle.file)
    }

    /// Drop every open handle.
    pub fn close_all(&mut self) {
        self.handles.clear();
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    fn close_idle(&mut self) {
        let idle_limit = self.idle_limit;
        self.handles.retain(|_, handle| handle.last_used.elapsed() < idle_limit);
    }

    /// Make room for one more handle by evicting the least recently used.
    fn evict_to_fit(&mut self) {
        while self.handles.len() >= self.capacity {
            let oldest = self
                .handles
                .iter()
                .min_by_key(|(_, handle)| handle.last_used)
                .map(|(index, _)| *index);
            match oldest {
                Some(index) => self.handles.remove(&index),
                None => break,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::{FileCache, IDLE_LIMIT};

    #[test]
    fn caches_handles_up_to_capacity_and_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FileCache::new(2, IDLE_LIMIT);

        for index in 0..3usize {
            let path = dir.path().join(format!("file-{index}"));
            cache
                .with_file(index, &path, true, |file| file.write_all(b"x"))
                .unwrap();
        }

        // Capacity 2: file 0 was evicted when file 2 was opened.
        assert_eq!(cache.open_count(), 2);
    }

    #[test]
    fn missing_files_error_when_create_is_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FileCache::new(2, IDLE_LIMIT);

        let result = cache.with_file(0, &dir.path().join("absent"), false, |_| Ok(()));
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn idle_handles_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FileCache::new(8, Duration::from_millis(1));

        let path = dir.path().join("file");
        cache.with_file(0, &path, true, |_| Ok(())).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let other = dir.path().join("other");
        cache.with_file(1, &other, true, |_| Ok(())).unwrap();
        assert_eq!(cache.open_count(), 1);
    }

    #[test]
    fn close_all_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FileCache::new(8, IDLE_LIMIT);
        cache.with_file(0, &dir.path().join("a"), true, |_| Ok(())).unwrap();

        cache.close_all();
        assert_eq!(cache.open_count(), 0);
    }
}
