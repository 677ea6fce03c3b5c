//! Maps a session id to its narrative log file.
//!
//! Lookup order: process cache, stored pointer, scan of recent date
//! directories, then allocation of a new file. Whatever is found or
//! allocated is written back to the cache and the store.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use quill_core::{PersistError, SessionId};
use quill_store::SessionRepo;

use crate::error::NarrativeError;

/// `{seq}_{HHMMSS}_{prefix}_{project}.md`
static NARRATIVE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2,})_(\d{6})_([A-Za-z0-9]+)_(.*)\.md$").unwrap());

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

const DATE_DIR_FORMAT: &str = "%Y-%m-%d";
const PROJECT_NAME_MAX: usize = 40;

/// Durable home of narrative pointers.
pub trait NarrativePointers {
    fn load_pointer(&self, id: &SessionId) -> Result<Option<PathBuf>, PersistError>;
    fn save_pointer(&self, id: &SessionId, project: &str, path: &Path) -> Result<(), PersistError>;
}

impl NarrativePointers for SessionRepo {
    fn load_pointer(&self, id: &SessionId) -> Result<Option<PathBuf>, PersistError> {
        Ok(self.narrative_path(id)?.map(PathBuf::from))
    }

    fn save_pointer(&self, id: &SessionId, project: &str, path: &Path) -> Result<(), PersistError> {
        Ok(self.set_narrative_path(id, project, &path.to_string_lossy())?)
    }
}

/// Where a resolved target came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetOrigin {
    Cache,
    Store,
    Scan,
    Allocated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarrativeTarget {
    pub path: PathBuf,
    pub origin: TargetOrigin,
}

impl NarrativeTarget {
    /// True when the file was created by this resolution.
    pub fn is_new(&self) -> bool {
        self.origin == TargetOrigin::Allocated
    }
}

pub struct SessionResolver {
    base_dir: PathBuf,
    scan_days: usize,
    cache: Mutex<HashMap<SessionId, PathBuf>>,
}

impl SessionResolver {
    pub fn new(base_dir: impl Into<PathBuf>, scan_days: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            scan_days,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Return the session's narrative file, allocating one if none exists.
    pub fn resolve(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        id: &SessionId,
        project: &str,
        started_at: &DateTime<Utc>,
    ) -> Result<NarrativeTarget, NarrativeError> {
        if let Some(target) = self.locate(pointers, id, project) {
            return Ok(target);
        }

        let path = self.allocate(id, project, started_at)?;
        debug!(session_id = %id, path = %path.display(), "allocated narrative log");
        self.remember(pointers, id, project, &path, true);
        Ok(NarrativeTarget {
            path,
            origin: TargetOrigin::Allocated,
        })
    }

    /// Find an existing target without allocating.
    pub fn locate(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        id: &SessionId,
        project: &str,
    ) -> Option<NarrativeTarget> {
        if let Some(path) = self.cached(id) {
            return Some(NarrativeTarget {
                path,
                origin: TargetOrigin::Cache,
            });
        }

        if let Some(path) = pointers.and_then(|p| stored_pointer(p, id)) {
            self.remember(None, id, project, &path, false);
            return Some(NarrativeTarget {
                path,
                origin: TargetOrigin::Store,
            });
        }

        if let Some(path) = self.scan(id) {
            self.remember(pointers, id, project, &path, true);
            return Some(NarrativeTarget {
                path,
                origin: TargetOrigin::Scan,
            });
        }

        None
    }

    fn cached(&self, id: &SessionId) -> Option<PathBuf> {
        let mut cache = self.cache.lock();
        match cache.get(id) {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(_) => {
                let _ = cache.remove(id);
                None
            }
            None => None,
        }
    }

    fn remember(
        &self,
        pointers: Option<&dyn NarrativePointers>,
        id: &SessionId,
        project: &str,
        path: &Path,
        persist: bool,
    ) {
        let _ = self.cache.lock().insert(id.clone(), path.to_path_buf());
        if !persist {
            return;
        }
        if let Some(pointers) = pointers {
            if let Err(e) = pointers.save_pointer(id, project, path) {
                warn!(session_id = %id, error = %e, "could not store narrative pointer");
            }
        }
    }

    /// Search the most recent date directories for a file carrying the
    /// session's short prefix.
    fn scan(&self, id: &SessionId) -> Option<PathBuf> {
        let prefix = id.short();
        let mut dates: Vec<(NaiveDate, PathBuf)> = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter_map(|e| {
                    let name = e.file_name();
                    let date =
                        NaiveDate::parse_from_str(name.to_str()?, DATE_DIR_FORMAT).ok()?;
                    Some((date, e.path()))
                })
                .collect(),
            Err(_) => return None,
        };
        dates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, dir) in dates.into_iter().take(self.scan_days) {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut matches: Vec<(u32, PathBuf)> = entries
                .filter_map(Result::ok)
                .filter_map(|e| {
                    let name = e.file_name();
                    let parsed = parse_file_name(name.to_str()?)?;
                    (parsed.prefix == prefix).then(|| (parsed.sequence, e.path()))
                })
                .collect();
            matches.sort_by(|a, b| b.0.cmp(&a.0));
            if let Some((_, path)) = matches.into_iter().next() {
                debug!(session_id = %id, path = %path.display(), "found narrative log by scan");
                return Some(path);
            }
        }
        None
    }

    fn allocate(
        &self,
        id: &SessionId,
        project: &str,
        started_at: &DateTime<Utc>,
    ) -> Result<PathBuf, NarrativeError> {
        let local = started_at.with_timezone(&Local);
        let dir = self.base_dir.join(local.format(DATE_DIR_FORMAT).to_string());
        fs::create_dir_all(&dir).map_err(|e| NarrativeError::io(&dir, e))?;

        let sequence = next_sequence(&dir);
        let name = format!(
            "{sequence:02}_{}_{}_{}.md",
            local.format("%H%M%S"),
            id.short(),
            sanitize_project_name(project)
        );
        let path = dir.join(name);
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| NarrativeError::io(&path, e))?;
        Ok(path)
    }
}

fn stored_pointer(pointers: &dyn NarrativePointers, id: &SessionId) -> Option<PathBuf> {
    match pointers.load_pointer(id) {
        Ok(Some(path)) if path.is_file() => Some(path),
        Ok(Some(path)) => {
            debug!(session_id = %id, path = %path.display(), "stored narrative pointer is stale");
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(session_id = %id, error = %e, "narrative pointer lookup failed");
            None
        }
    }
}

/// Components of a narrative file name.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedFileName<'a> {
    pub sequence: u32,
    pub time: &'a str,
    pub prefix: &'a str,
    pub project: &'a str,
}

pub fn parse_file_name(name: &str) -> Option<ParsedFileName<'_>> {
    let caps = NARRATIVE_FILE.captures(name)?;
    Some(ParsedFileName {
        sequence: caps.get(1)?.as_str().parse().ok()?,
        time: caps.get(2)?.as_str(),
        prefix: caps.get(3)?.as_str(),
        project: caps.get(4)?.as_str(),
    })
}

/// One past the highest sequence number in `dir`, starting at 1.
///
/// Not coordinated across processes: two writers allocating in the same
/// directory at once can pick the same number.
fn next_sequence(dir: &Path) -> u32 {
    let highest = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| {
                    let name = e.file_name();
                    parse_file_name(name.to_str()?).map(|p| p.sequence)
                })
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    highest + 1
}

/// Last path component of the project, reduced to filename-safe characters.
pub fn sanitize_project_name(project: &str) -> String {
    let last = project
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned = UNSAFE_CHARS.replace_all(last, "-");
    let trimmed: String = cleaned
        .trim_matches(|c| c == '-' || c == '.')
        .chars()
        .take(PROJECT_NAME_MAX)
        .collect();
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct MemoryPointers {
        map: Mutex<HashMap<SessionId, PathBuf>>,
        fail: bool,
    }

    impl NarrativePointers for MemoryPointers {
        fn load_pointer(&self, id: &SessionId) -> Result<Option<PathBuf>, PersistError> {
            if self.fail {
                return Err(PersistError::TransientStore("busy".into()));
            }
            Ok(self.map.lock().get(id).cloned())
        }

        fn save_pointer(&self, id: &SessionId, _: &str, path: &Path) -> Result<(), PersistError> {
            if self.fail {
                return Err(PersistError::TransientStore("busy".into()));
            }
            let _ = self.map.lock().insert(id.clone(), path.to_path_buf());
            Ok(())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn allocates_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SessionResolver::new(dir.path(), 7);
        let id = SessionId::from_raw("abc12345-ffff");

        let target = resolver.resolve(None, &id, "/home/me/my app", &start()).unwrap();
        assert!(target.is_new());
        assert!(target.path.is_file());

        let name = target.path.file_name().unwrap().to_str().unwrap().to_string();
        let parsed = parse_file_name(&name).unwrap();
        assert_eq!(parsed.sequence, 1);
        assert_eq!(parsed.prefix, "abc12345");
        assert_eq!(parsed.project, "my-app");
        let local = start().with_timezone(&Local);
        assert_eq!(parsed.time, local.format("%H%M%S").to_string());
        assert_eq!(
            target.path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
            local.format("%Y-%m-%d").to_string()
        );
    }

    #[test]
    fn same_process_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SessionResolver::new(dir.path(), 7);
        let id = SessionId::from_raw("abc12345");
        let first = resolver.resolve(None, &id, "/p", &start()).unwrap();
        let second = resolver.resolve(None, &id, "/p", &start()).unwrap();
        assert_eq!(second.origin, TargetOrigin::Cache);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn fresh_resolver_uses_stored_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let pointers = MemoryPointers::default();
        let id = SessionId::from_raw("abc12345");

        let first = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&pointers), &id, "/p", &start())
            .unwrap();
        let second = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&pointers), &id, "/p", &start())
            .unwrap();
        assert_eq!(second.origin, TargetOrigin::Store);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn unreachable_store_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let broken = MemoryPointers {
            fail: true,
            ..Default::default()
        };
        let id = SessionId::from_raw("abc12345");

        let first = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&broken), &id, "/p", &start())
            .unwrap();
        let second = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&broken), &id, "/p", &start())
            .unwrap();
        assert_eq!(second.origin, TargetOrigin::Scan);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn stale_pointer_reallocates() {
        let dir = tempfile::tempdir().unwrap();
        let pointers = MemoryPointers::default();
        let id = SessionId::from_raw("abc12345");
        let first = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&pointers), &id, "/p", &start())
            .unwrap();
        fs::remove_file(&first.path).unwrap();

        let second = SessionResolver::new(dir.path(), 7)
            .resolve(Some(&pointers), &id, "/p", &start())
            .unwrap();
        assert!(second.is_new());
        assert!(second.path.is_file());
        assert_eq!(pointers.load_pointer(&id).unwrap(), Some(second.path));
    }

    #[test]
    fn sequence_increments_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SessionResolver::new(dir.path(), 7);
        let a = resolver
            .resolve(None, &SessionId::from_raw("aaaa1111"), "/p", &start())
            .unwrap();
        let b = resolver
            .resolve(None, &SessionId::from_raw("bbbb2222"), "/p", &start())
            .unwrap();
        let seq = |p: &Path| {
            parse_file_name(p.file_name().unwrap().to_str().unwrap())
                .unwrap()
                .sequence
        };
        assert_eq!(seq(&a.path), 1);
        assert_eq!(seq(&b.path), 2);
    }

    #[test]
    fn scan_window_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("2020-01-01");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("01_120000_abc12345_p.md"), "# old").unwrap();
        for day in 1..=3 {
            fs::create_dir_all(dir.path().join(format!("2026-02-0{day}"))).unwrap();
        }

        let id = SessionId::from_raw("abc12345");
        let narrow = SessionResolver::new(dir.path(), 2);
        assert!(narrow.locate(None, &id, "/p").is_none());

        let wide = SessionResolver::new(dir.path(), 7);
        let found = wide.locate(None, &id, "/p").unwrap();
        assert_eq!(found.origin, TargetOrigin::Scan);
        assert_eq!(found.path, old.join("01_120000_abc12345_p.md"));
    }

    #[test]
    fn file_name_parsing() {
        let parsed = parse_file_name("03_091500_deadbeef_quill.md").unwrap();
        assert_eq!(
            parsed,
            ParsedFileName {
                sequence: 3,
                time: "091500",
                prefix: "deadbeef",
                project: "quill",
            }
        );
        assert!(parse_file_name("notes.md").is_none());
        assert!(parse_file_name("01_0915_deadbeef_quill.md").is_none());
    }

    #[test]
    fn project_names_sanitized() {
        assert_eq!(sanitize_project_name("/home/me/quill"), "quill");
        assert_eq!(sanitize_project_name("/home/me/quill/"), "quill");
        assert_eq!(sanitize_project_name("C:\\work\\My Project"), "My-Project");
        assert_eq!(sanitize_project_name("/"), "project");
        assert_eq!(sanitize_project_name("unknown"), "unknown");
        assert_eq!(sanitize_project_name(&"x".repeat(80)).len(), PROJECT_NAME_MAX);
    }
}
