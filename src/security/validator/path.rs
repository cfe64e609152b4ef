//! File path validation: traversal detection, root confinement, and the
//! bounded cache of previously accepted paths.

use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use super::patterns::OVERLONG_UTF8;
use super::{InputValidator, ValidationResult};
use crate::security::events::{EventKind, Severity};

const TRAVERSAL: &str = "Path traversal attempt detected";

/// Rounds of percent-decoding applied when looking for hidden sequences.
const DECODE_PASSES: usize = 3;

/// FIFO cache of inputs that passed the lexical checks. Resolution against
/// the filesystem is never cached.
pub(super) struct PathCache {
    entries: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn insert(&mut self, key: String) {
        if self.capacity == 0 || self.entries.contains(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Resolve the configured root, defaulting to the working directory.
pub(super) fn resolve_root(configured: Option<&str>) -> PathBuf {
    let base = match configured {
        Some(raw) if !raw.trim().is_empty() => PathBuf::from(shellexpand::tilde(raw).into_owned()),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let absolute = if base.is_absolute() {
        base
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(base)
    };
    absolute.canonicalize().unwrap_or(absolute)
}

impl InputValidator {
    /// Validate a user-supplied relative path and resolve it under the root.
    ///
    /// Traversal is checked on the raw string and on up to three rounds of
    /// percent-decoding; any hit stops validation before the filesystem is
    /// touched. The sanitized value is the resolved absolute path.
    pub fn validate_file_path(&self, input: &str) -> ValidationResult<PathBuf> {
        let caching = self.caching.load(Ordering::Relaxed);
        let cached = caching
            && self
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(input);
        if !cached && let Err(result) = self.check_lexically(input) {
            return result;
        }

        // Filesystem resolution is never served from the cache.
        let resolved = resolve_existing(&normalize(&self.root.join(input)));
        if !resolved.starts_with(&self.root) {
            let message = "Path resolves outside the allowed root directory".to_string();
            self.report(EventKind::PathTraversal, Severity::Critical, input, &message);
            return ValidationResult::invalid(vec![message], Vec::new());
        }

        if let Some(dir) = self.sensitive_match(&resolved) {
            let message = format!("Access to sensitive directory denied: {}", dir);
            self.report(EventKind::PathTraversal, Severity::High, input, &message);
            return ValidationResult::invalid(vec![message], Vec::new());
        }

        if caching && !cached {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(input.to_string());
        }
        ValidationResult::valid(resolved)
    }

    /// Length and traversal checks that depend only on the input string.
    fn check_lexically(&self, input: &str) -> Result<(), ValidationResult<PathBuf>> {
        if input.is_empty() {
            return Err(ValidationResult::invalid(
                vec!["Path must not be empty".to_string()],
                Vec::new(),
            ));
        }
        if input.len() > self.config.max_path_length {
            return Err(ValidationResult::invalid(
                vec![format!(
                    "Path exceeds maximum length of {} bytes",
                    self.config.max_path_length
                )],
                Vec::new(),
            ));
        }

        let traversal = traversal_reasons(input);
        if !traversal.is_empty() {
            let errors: Vec<String> = traversal
                .iter()
                .map(|reason| format!("{}: {}", TRAVERSAL, reason))
                .collect();
            for error in &errors {
                self.report(EventKind::PathTraversal, Severity::Critical, input, error);
            }
            return Err(ValidationResult::invalid(errors, Vec::new()));
        }
        Ok(())
    }

    /// Component entries (`.ssh`) match anywhere below the root; absolute
    /// entries (`/etc`) match by prefix unless the root itself lives there.
    fn sensitive_match(&self, resolved: &Path) -> Option<&str> {
        let relative = resolved.strip_prefix(&self.root).unwrap_or(resolved);
        self.config.sensitive_dirs.iter().map(String::as_str).find(|dir| {
            if dir.starts_with('/') {
                let prefix = Path::new(dir);
                resolved.starts_with(prefix) && !self.root.starts_with(prefix)
            } else {
                relative
                    .components()
                    .any(|c| c.as_os_str() == std::ffi::OsStr::new(dir))
            }
        })
    }
}

/// Every traversal reason found in `input`, at most one per category.
fn traversal_reasons(input: &str) -> Vec<&'static str> {
    let decoded = decode_repeatedly(input);
    let mut reasons = Vec::new();

    if input.contains('\0') || decoded.contains('\0') {
        reasons.push("null byte in path");
    }
    if OVERLONG_UTF8.is_match(input) {
        reasons.push("overlong UTF-8 encoding");
    }
    if has_parent_reference(input) {
        reasons.push("parent directory reference");
    } else if has_parent_reference(&decoded) {
        reasons.push("encoded traversal sequence");
    }
    if input.starts_with('~') || decoded.starts_with('~') {
        reasons.push("home directory shortcut");
    }
    if is_absolute_like(input) || is_absolute_like(&decoded) {
        reasons.push("absolute path");
    }
    reasons
}

/// `..` as a whole segment, or `..` directly followed by a separator.
fn has_parent_reference(path: &str) -> bool {
    path.contains("../")
        || path.contains("..\\")
        || path.split(['/', '\\']).any(|part| part == "..")
}

fn is_absolute_like(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn decode_repeatedly(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..DECODE_PASSES {
        if !current.contains('%') {
            break;
        }
        let next = percent_decode(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Lexical normalization: drop `.` and fold `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor so symlinks are followed
/// even when the leaf does not exist yet.
fn resolve_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::validator::test_validator;

    #[test]
    fn parent_traversal_yields_single_error() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_file_path("../../etc/passwd");
        assert!(!result.is_valid());
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].starts_with("Path traversal attempt detected"));
        let events = v.auditor().trail().of_kind(EventKind::PathTraversal);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn traversal_in_any_encoding_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let attacks = [
            "docs/../../secret",
            "..\\windows\\system32",
            "..",
            "~/notes.md",
            "~root",
            "file\0.md",
            "file%00.md",
            "%2e%2e%2fetc",
            "%2E%2E/etc",
            "%252e%252e%252fsecret",
            "%25252e%25252e%25252fsecret",
            "%c0%ae%c0%ae/secret",
            "/etc/passwd",
            "\\\\server\\share",
            "C:\\Windows",
            "%2fetc%2fpasswd",
            "x../y",
            "notes..\\y",
            "a..%2fb",
        ];
        for attack in attacks {
            let result = v.validate_file_path(attack);
            assert!(!result.is_valid(), "accepted {:?}", attack);
            assert!(result.sanitized_value().is_none());
        }
    }

    #[test]
    fn encoded_traversal_is_named() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_file_path("%2e%2e%2fsecret");
        assert_eq!(
            result.errors(),
            &["Path traversal attempt detected: encoded traversal sequence".to_string()]
        );
    }

    #[test]
    fn relative_path_resolves_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_file_path("docs/./guide.md");
        assert!(result.is_valid(), "{:?}", result.errors());
        assert_eq!(result.sanitized_value().unwrap(), &v.root().join("docs/guide.md"));
    }

    #[test]
    fn dotted_names_are_not_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        assert!(v.validate_file_path("notes..md").is_valid());
        assert!(v.validate_file_path("...").is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();

        let v = test_validator(tmp.path());
        for input in ["link/secret.txt", "link/missing/new.txt"] {
            let result = v.validate_file_path(input);
            assert!(!result.is_valid(), "accepted {}", input);
            assert_eq!(
                result.errors()[0],
                "Path resolves outside the allowed root directory"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn cached_path_is_rechecked_after_symlink_swap() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        assert!(v.validate_file_path("shared/report.md").is_valid());
        assert!(v.cache.lock().unwrap().contains("shared/report.md"));

        std::os::unix::fs::symlink(outside.path(), tmp.path().join("shared")).unwrap();
        let result = v.validate_file_path("shared/report.md");
        assert!(!result.is_valid());
        assert_eq!(
            result.errors()[0],
            "Path resolves outside the allowed root directory"
        );
    }

    #[test]
    fn sensitive_directories_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        let git = v.validate_file_path(".git/config");
        assert!(!git.is_valid());
        assert_eq!(git.errors()[0], "Access to sensitive directory denied: .git");

        assert!(!v.validate_file_path("home/user/.ssh/id_rsa").is_valid());
        assert!(v.validate_file_path("docs/git-notes.md").is_valid());
    }

    #[test]
    fn valid_paths_are_cached_until_caching_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        assert!(v.validate_file_path("a.md").is_valid());
        assert!(v.validate_file_path("a.md").is_valid());
        assert!(!v.validate_file_path("../b.md").is_valid());
        assert_eq!(v.cache.lock().unwrap().len(), 1);

        v.set_caching(false);
        assert_eq!(v.cache.lock().unwrap().len(), 0);
        assert!(v.validate_file_path("a.md").is_valid());
        assert_eq!(v.cache.lock().unwrap().len(), 0);
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let mut cache = PathCache::new(2);
        cache.insert("a".into());
        cache.insert("b".into());
        cache.insert("c".into());
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn decoding_stops_after_three_passes() {
        assert_eq!(decode_repeatedly("%252e"), ".");
        assert_eq!(decode_repeatedly("%2525252e"), "%2e");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
