// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copying of external resources (texture images, library objects) next to
//! a written document.
//!
//! Copies run on a fixed pool of worker threads fed through a bounded
//! channel; a full queue blocks the submitting thread. The first failure
//! raises an abort flag so that no further copies are started, and is
//! returned from [`ResourceCopier::finish`].

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::{Error, Result};

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopierConfig {
    pub workers: usize,
    /// Capacity of the task queue.
    pub queue: usize,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue: 64,
        }
    }
}

struct CopyTask {
    from: PathBuf,
    to: PathBuf,
}

struct Shared {
    copied: Mutex<FxHashSet<PathBuf>>,
    created_dirs: Mutex<FxHashSet<PathBuf>>,
    abort: AtomicBool,
    first_error: Mutex<Option<Error>>,
    completed: AtomicUsize,
}

impl Shared {
    fn fail(&self, error: Error) {
        self.abort.store(true, Ordering::SeqCst);
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn copy(&self, task: &CopyTask) -> Result<()> {
        if let Some(dir) = task.to.parent() {
            let created = self.created_dirs.lock().contains(dir);
            if !created {
                std::fs::create_dir_all(dir)?;
                self.created_dirs.lock().insert(dir.to_path_buf());
            }
        }
        std::fs::copy(&task.from, &task.to).map_err(|source| Error::ResourceCopy {
            from: task.from.clone(),
            to: task.to.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Copies resources referenced relative to an input directory into the
/// same relative location under an output directory.
pub struct ResourceCopier {
    source_base: PathBuf,
    target_base: PathBuf,
    sender: Option<Sender<CopyTask>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl ResourceCopier {
    /// Creates the copier and starts its workers. An empty `source_base`
    /// stands for the current directory.
    pub fn new(source_base: impl Into<PathBuf>, target_base: impl Into<PathBuf>, config: CopierConfig) -> Self {
        let source_base = absolute_base(source_base.into());
        let (sender, receiver) = bounded::<CopyTask>(config.queue.max(1));
        let shared = Arc::new(Shared {
            copied: Mutex::new(FxHashSet::default()),
            created_dirs: Mutex::new(FxHashSet::default()),
            abort: AtomicBool::new(false),
            first_error: Mutex::new(None),
            completed: AtomicUsize::new(0),
        });

        let workers = (0..config.workers.max(1))
            .map(|i| {
                let receiver: Receiver<CopyTask> = receiver.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("resource-copy-{i}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            if shared.abort.load(Ordering::SeqCst) {
                                continue;
                            }
                            match shared.copy(&task) {
                                Ok(()) => {
                                    shared.completed.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    tracing::warn!(from = %task.from.display(), error = %e, "resource copy failed");
                                    shared.fail(e);
                                }
                            }
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to spawn resource worker");
                    None
                }
            })
            .collect();

        Self {
            source_base,
            target_base: target_base.into(),
            sender: Some(sender),
            workers,
            shared,
        }
    }

    /// Queues a copy of `uri`, a path relative to the source base. Remote
    /// uris and already queued resources are skipped. Blocks while the
    /// queue is full.
    ///
    /// Returns `Ok(false)` if nothing was queued.
    pub fn submit(&self, uri: &str) -> Result<bool> {
        if uri.contains("://") || self.shared.abort.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let from = self.resolve(uri)?;
        if !self.shared.copied.lock().insert(from.clone()) {
            return Ok(false);
        }
        let relative = from.strip_prefix(&self.source_base).unwrap_or(&from);
        let task = CopyTask {
            to: self.target_base.join(relative),
            from,
        };

        if self.workers.is_empty() {
            if let Err(e) = self.shared.copy(&task) {
                self.shared.fail(e);
            }
            return Ok(true);
        }
        match &self.sender {
            Some(sender) => Ok(sender.send(task).is_ok()),
            None => Ok(false),
        }
    }

    /// The absolute source path of `uri`, refused when it leaves the base.
    pub fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let path = normalize(&self.source_base.join(uri));
        let escapes = matches!(path.components().next(), Some(Component::ParentDir));
        if escapes || path == self.source_base || !path.starts_with(&self.source_base) {
            return Err(Error::UnsafePath {
                path,
                base: self.source_base.clone(),
            });
        }
        Ok(path)
    }

    /// Waits for all queued copies. Returns the number of copied files, or
    /// the first error encountered.
    pub fn finish(mut self) -> Result<usize> {
        self.sender.take();
        let mut panicked = false;
        for worker in self.workers.drain(..) {
            panicked |= worker.join().is_err();
        }
        if let Some(error) = self.shared.first_error.lock().take() {
            return Err(error);
        }
        if panicked {
            return Err(Error::WorkerPanicked);
        }
        Ok(self.shared.completed.load(Ordering::Relaxed))
    }
}

impl Drop for ResourceCopier {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Canonical form of the source base. Falls back to a lexically normalised
/// absolute path when the directory cannot be canonicalised.
fn absolute_base(base: PathBuf) -> PathBuf {
    let base = if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base
    };
    if let Ok(canonical) = std::fs::canonicalize(&base) {
        return canonical;
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize(&cwd.join(&base)),
        Err(_) => normalize(&base),
    }
}

/// Lexically resolves `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("city-lite-res-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn copies_into_same_relative_location() {
        let input = temp_dir();
        let output = temp_dir();
        std::fs::create_dir_all(input.join("tex")).unwrap();
        std::fs::write(input.join("tex/roof.png"), b"png").unwrap();
        std::fs::write(input.join("tex/wall.png"), b"png").unwrap();

        let copier = ResourceCopier::new(&input, &output, CopierConfig { workers: 2, queue: 1 });
        assert!(copier.submit("tex/roof.png").unwrap());
        assert!(copier.submit("./tex/wall.png").unwrap());
        assert!(!copier.submit("tex/roof.png").unwrap());
        assert!(!copier.submit("https://example.org/remote.png").unwrap());
        assert_eq!(copier.finish().unwrap(), 2);

        assert_eq!(std::fs::read(output.join("tex/roof.png")).unwrap(), b"png");
        assert!(output.join("tex/wall.png").exists());
        let _ = std::fs::remove_dir_all(&input);
        let _ = std::fs::remove_dir_all(&output);
    }

    #[test]
    fn refuses_paths_outside_base() {
        let input = temp_dir();
        let copier = ResourceCopier::new(&input, temp_dir(), CopierConfig::default());
        let err = copier.submit("../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::UnsafePath { .. }));
        assert_eq!(copier.finish().unwrap(), 0);
    }

    #[test]
    fn first_failure_is_reported() {
        let input = temp_dir();
        let copier = ResourceCopier::new(&input, temp_dir(), CopierConfig { workers: 1, queue: 4 });
        copier.submit("missing.png").unwrap();
        let err = copier.finish().unwrap_err();
        assert!(matches!(err, Error::ResourceCopy { .. }));
    }

    #[test]
    fn bare_file_name_input_is_confined_to_current_directory() {
        // `doc.jsonl` has an empty parent.
        let base = Path::new("doc.jsonl").parent().unwrap();
        let copier = ResourceCopier::new(base, temp_dir(), CopierConfig::default());

        let err = copier.submit("../../etc/hostname").unwrap_err();
        assert!(matches!(err, Error::UnsafePath { .. }));
        assert!(matches!(copier.resolve("/etc/hostname"), Err(Error::UnsafePath { .. })));

        let cwd = std::fs::canonicalize(std::env::current_dir().unwrap()).unwrap();
        assert_eq!(copier.resolve("tex/roof.png").unwrap(), cwd.join("tex/roof.png"));
        assert_eq!(copier.finish().unwrap(), 0);
    }

    #[test]
    fn submissions_after_a_failure_are_skipped() {
        let input = temp_dir();
        let output = temp_dir();
        std::fs::write(input.join("late.png"), b"png").unwrap();
        let copier = ResourceCopier::new(&input, &output, CopierConfig { workers: 1, queue: 4 });

        assert!(copier.submit("missing.png").unwrap());
        let deadline = Instant::now() + Duration::from_secs(10);
        while !copier.shared.abort.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "copy failure was not recorded");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!copier.submit("late.png").unwrap());
        assert!(matches!(copier.finish().unwrap_err(), Error::ResourceCopy { .. }));
        assert!(!output.join("late.png").exists());
        let _ = std::fs::remove_dir_all(&input);
        let _ = std::fs::remove_dir_all(&output);
    }

    #[test]
    fn full_queue_blocks_until_workers_catch_up() {
        let input = temp_dir();
        let output = temp_dir();
        std::fs::create_dir_all(input.join("tex")).unwrap();
        for i in 0..32 {
            std::fs::write(input.join(format!("tex/{i}.png")), b"png").unwrap();
        }

        let copier = ResourceCopier::new(&input, &output, CopierConfig { workers: 1, queue: 1 });
        for i in 0..32 {
            assert!(copier.submit(&format!("tex/{i}.png")).unwrap());
        }
        assert_eq!(copier.finish().unwrap(), 32);
        assert!((0..32).all(|i| output.join(format!("tex/{i}.png")).exists()));
        let _ = std::fs::remove_dir_all(&input);
        let _ = std::fs::remove_dir_all(&output);
    }
}
