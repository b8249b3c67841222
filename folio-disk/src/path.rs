use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::error::PathError;

// ── Constants ───────────────────────────────────────────────────────────────

pub const ROOT: &str = "/";
pub const TRASH_DIR: &str = "/.trash";
pub const STORAGE_DIR: &str = "/.storage";
pub const GIT_DIR: &str = "/.git";

/// Characters escaped inside a single URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// ── Limits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PathLimits {
    pub max_path_length: usize,
    pub max_name_length: usize,
    pub max_path_depth: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            max_path_length: 4096,
            max_name_length: 255,
            max_path_depth: 64,
        }
    }
}

// ── AbsPath ─────────────────────────────────────────────────────────────────

/// A normalized absolute path: leading `/`, no trailing slash except for the
/// root, no empty, `.` or `..` segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AbsPath(String);

impl AbsPath {
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// Final segment; empty for the root.
    pub fn name(&self) -> &str {
        basename(&self.0)
    }

    pub fn parent(&self) -> Option<AbsPath> {
        if self.is_root() {
            return None;
        }
        Some(AbsPath(dirname(&self.0).to_string()))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Root has depth 0, `/a` has depth 1.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Append a single already-valid child name.
    pub fn child(&self, name: &str) -> Result<AbsPath, PathError> {
        validate_segment(&self.0, name)?;
        if self.is_root() {
            Ok(AbsPath(format!("/{}", name)))
        } else {
            Ok(AbsPath(format!("{}/{}", self.0, name)))
        }
    }

    /// Resolve a relative path against this one. `..` never climbs above
    /// the root.
    pub fn join(&self, rel: &str) -> Result<AbsPath, PathError> {
        join(self.as_str(), rel)
    }

    /// All proper ancestors, root first.
    pub fn ancestors(&self) -> Vec<AbsPath> {
        let mut out = Vec::new();
        let mut cur = self.parent();
        while let Some(p) = cur {
            cur = p.parent();
            out.push(p);
        }
        out.reverse();
        out
    }

    /// True when `self` is `other` or lives underneath it.
    pub fn starts_with(&self, other: &AbsPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &AbsPath) -> bool {
        self != other && other.starts_with(self)
    }

    /// Re-root a path living under `from` so it lives under `to`.
    pub fn rebase(&self, from: &AbsPath, to: &AbsPath) -> Option<AbsPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[..]
        } else {
            &self.0[from.0.len()..]
        };
        if rest.is_empty() || rest == ROOT {
            return Some(to.clone());
        }
        if to.is_root() {
            Some(AbsPath(rest.to_string()))
        } else {
            Some(AbsPath(format!("{}{}", to.0, rest)))
        }
    }

    /// Path relative to `base`, without a leading slash. `None` when `self`
    /// does not live under `base`.
    pub fn relative_to(&self, base: &AbsPath) -> Option<&str> {
        if !self.starts_with(base) {
            return None;
        }
        if base.is_root() {
            return Some(self.0.trim_start_matches('/'));
        }
        Some(self.0[base.0.len()..].trim_start_matches('/'))
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AbsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for AbsPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

impl TryFrom<String> for AbsPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize(&value)
    }
}

impl TryFrom<&str> for AbsPath {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        normalize(value)
    }
}

impl From<AbsPath> for String {
    fn from(p: AbsPath) -> String {
        p.0
    }
}

// ── Path functions ──────────────────────────────────────────────────────────

pub fn is_absolute(input: &str) -> bool {
    input.starts_with('/')
}

/// Normalize an absolute path: replace backslashes, drop empty and `.`
/// segments, resolve `..` (clamped at the root) and strip the trailing
/// slash.
pub fn normalize(input: &str) -> Result<AbsPath, PathError> {
    if input.is_empty() {
        return Err(PathError::Empty);
    }
    let unified = input.replace('\\', "/");
    if !is_absolute(&unified) {
        return Err(PathError::NotAbsolute(input.to_string()));
    }
    let mut resolved: Vec<&str> = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                resolved.pop();
            }
            other => {
                validate_segment(input, other)?;
                resolved.push(other);
            }
        }
    }
    if resolved.is_empty() {
        Ok(AbsPath::root())
    } else {
        Ok(AbsPath(format!("/{}", resolved.join("/"))))
    }
}

/// Join `rel` onto the absolute `base`. A leading slash on `rel` is treated
/// as relative, so the result always stays inside `base`'s root.
pub fn join(base: &str, rel: &str) -> Result<AbsPath, PathError> {
    let base = normalize(base)?;
    let rel = rel.trim_start_matches(['/', '\\']);
    if rel.is_empty() {
        return Ok(base);
    }
    if base.is_root() {
        normalize(&format!("/{}", rel))
    } else {
        normalize(&format!("{}/{}", base.as_str(), rel))
    }
}

/// Directory portion of a path. The root is its own dirname.
pub fn dirname(path: &str) -> &str {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    match trimmed.rfind('/') {
        Some(0) | None => ROOT,
        Some(pos) => &trimmed[..pos],
    }
}

/// Final segment of a path. Empty for the root.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Split the final segment into its prefix and extension (with the dot).
/// Dotfiles such as `.trash` have no extension.
pub fn split_ext(path: &str) -> (&str, &str) {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => (&name[..pos], &name[pos..]),
    }
}

pub fn prefix(path: &str) -> &str {
    split_ext(path).0
}

pub fn extension(path: &str) -> &str {
    split_ext(path).1
}

/// `name.md` with `n = 2` becomes `name-2.md` in the same directory.
pub fn numbered(path: &AbsPath, n: usize) -> AbsPath {
    let (stem, ext) = split_ext(path.as_str());
    let name = format!("{}-{}{}", stem, n, ext);
    let dir = dirname(path.as_str());
    if dir == ROOT {
        AbsPath(format!("/{}", name))
    } else {
        AbsPath(format!("{}/{}", dir, name))
    }
}

/// Percent-encode each segment for use inside a URL.
pub fn encode_path(path: &AbsPath) -> String {
    if path.is_root() {
        return ROOT.to_string();
    }
    path.segments()
        .map(|seg| format!("/{}", utf8_percent_encode(seg, SEGMENT)))
        .collect()
}

pub fn decode_path(encoded: &str) -> Result<AbsPath, PathError> {
    let mut out = String::with_capacity(encoded.len());
    for (i, seg) in encoded.split('/').enumerate() {
        if i > 0 {
            out.push('/');
        }
        let decoded = percent_decode_str(seg)
            .decode_utf8()
            .map_err(|_| PathError::InvalidEncoding(encoded.to_string()))?;
        if decoded.contains('/') {
            return Err(PathError::InvalidEncoding(encoded.to_string()));
        }
        out.push_str(&decoded);
    }
    normalize(&out)
}

/// Check a single segment for forbidden characters (control chars).
fn validate_segment(path: &str, segment: &str) -> Result<(), PathError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(PathError::InvalidSegment {
            path: path.to_string(),
            reason: format!("reserved segment {:?}", segment),
        });
    }
    if segment.bytes().any(|b| b <= 0x1f || b == b'/' || b == b'\\') {
        return Err(PathError::InvalidSegment {
            path: path.to_string(),
            reason: "segment contains forbidden characters".to_string(),
        });
    }
    Ok(())
}

/// Validate a normalized path against configured limits.
pub fn validate(path: &AbsPath, limits: &PathLimits) -> Result<(), PathError> {
    if path.as_str().len() > limits.max_path_length {
        return Err(PathError::LimitExceeded(format!(
            "path exceeds max length ({})",
            limits.max_path_length
        )));
    }
    if path.depth() > limits.max_path_depth {
        return Err(PathError::LimitExceeded(format!(
            "path exceeds max depth ({})",
            limits.max_path_depth
        )));
    }
    if let Some(seg) = path.segments().find(|s| s.len() > limits.max_name_length) {
        return Err(PathError::LimitExceeded(format!(
            "segment {:?} exceeds max name length ({})",
            seg, limits.max_name_length
        )));
    }
    Ok(())
}

/// Drop every path that is covered by another path in the set, keeping the
/// outermost ones. Output is sorted and deduplicated.
pub fn reduce_paths(paths: &[AbsPath]) -> Vec<AbsPath> {
    let mut sorted: Vec<AbsPath> = paths.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut out: Vec<AbsPath> = Vec::new();
    for p in sorted {
        if out.iter().any(|kept| p.starts_with(kept)) {
            continue;
        }
        out.push(p);
    }
    out
}

// ── Special directories ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialDir {
    Trash,
    Storage,
    Git,
}

impl SpecialDir {
    pub const ALL: [SpecialDir; 3] = [SpecialDir::Trash, SpecialDir::Storage, SpecialDir::Git];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trash => TRASH_DIR,
            Self::Storage => STORAGE_DIR,
            Self::Git => GIT_DIR,
        }
    }

    pub fn path(&self) -> AbsPath {
        AbsPath(self.as_str().to_string())
    }
}

/// The reserved directory `path` lives in (or is), if any.
pub fn special_dir_of(path: &AbsPath) -> Option<SpecialDir> {
    SpecialDir::ALL
        .into_iter()
        .find(|dir| path.starts_with(&dir.path()))
}

pub fn is_special(path: &AbsPath) -> bool {
    special_dir_of(path).is_some()
}

pub fn is_in_trash(path: &AbsPath) -> bool {
    special_dir_of(path) == Some(SpecialDir::Trash)
}

/// `/a/b.md` → `/.trash/a/b.md`
pub fn trash_path_for(path: &AbsPath) -> AbsPath {
    path.rebase(&AbsPath::root(), &SpecialDir::Trash.path())
        .unwrap_or_else(|| SpecialDir::Trash.path())
}

/// `/.trash/a/b.md` → `/a/b.md`; `None` outside the trash or for the trash
/// directory itself.
pub fn untrash_path_for(path: &AbsPath) -> Option<AbsPath> {
    let trash = SpecialDir::Trash.path();
    if !is_in_trash(path) || *path == trash {
        return None;
    }
    path.rebase(&trash, &AbsPath::root())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> AbsPath {
        normalize(s).unwrap()
    }

    // ── normalize ───────────────────────────────────────────────────────

    #[test]
    fn normalize_basic_path() {
        assert_eq!(p("/foo/bar").as_str(), "/foo/bar");
    }

    #[test]
    fn normalize_root() {
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("//").as_str(), "/");
    }

    #[test]
    fn normalize_dot_and_dotdot() {
        assert_eq!(p("/foo/./bar").as_str(), "/foo/bar");
        assert_eq!(p("/foo/bar/../baz").as_str(), "/foo/baz");
        assert_eq!(p("/foo/../../bar").as_str(), "/bar");
    }

    #[test]
    fn normalize_trailing_and_double_slashes() {
        assert_eq!(p("/foo//bar/").as_str(), "/foo/bar");
    }

    #[test]
    fn normalize_backslashes() {
        assert_eq!(p("/foo\\bar").as_str(), "/foo/bar");
    }

    #[test]
    fn normalize_rejects_empty_and_relative() {
        assert_eq!(normalize(""), Err(PathError::Empty));
        assert!(matches!(normalize("foo/bar"), Err(PathError::NotAbsolute(_))));
    }

    #[test]
    fn normalize_rejects_control_chars() {
        assert!(matches!(
            normalize("/foo\x01/bar"),
            Err(PathError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["/", "/a", "/a/b/../c/", "/x//y/./z", "/../../q", "/a b/c.md"] {
            let once = p(raw);
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "input {:?}", raw);
        }
    }

    // ── join ────────────────────────────────────────────────────────────

    #[test]
    fn join_relative() {
        assert_eq!(join("/a", "b/c").unwrap().as_str(), "/a/b/c");
        assert_eq!(join("/", "b").unwrap().as_str(), "/b");
        assert_eq!(join("/a", "").unwrap().as_str(), "/a");
    }

    #[test]
    fn join_never_escapes_root() {
        assert_eq!(join("/a", "../../../etc").unwrap().as_str(), "/etc");
        assert_eq!(join("/a", "/b").unwrap().as_str(), "/a/b");
    }

    // ── dirname / basename / ext ────────────────────────────────────────

    #[test]
    fn dirname_and_basename() {
        assert_eq!(dirname("/a/b/c.md"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/a/b/c.md"), "c.md");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn split_extension() {
        assert_eq!(split_ext("/a/b.tar.gz"), ("b.tar", ".gz"));
        assert_eq!(split_ext("/a/README"), ("README", ""));
        assert_eq!(split_ext("/.trash"), (".trash", ""));
        assert_eq!(prefix("/notes/today.md"), "today");
        assert_eq!(extension("/notes/today.md"), ".md");
    }

    #[test]
    fn numbered_keeps_extension() {
        assert_eq!(numbered(&p("/a/note.md"), 2).as_str(), "/a/note-2.md");
        assert_eq!(numbered(&p("/dir"), 1).as_str(), "/dir-1");
    }

    // ── AbsPath ─────────────────────────────────────────────────────────

    #[test]
    fn ancestors_root_first() {
        let a: Vec<String> = p("/a/b/c").ancestors().into_iter().map(String::from).collect();
        assert_eq!(a, vec!["/", "/a", "/a/b"]);
        assert!(AbsPath::root().ancestors().is_empty());
    }

    #[test]
    fn starts_with_respects_segment_boundaries() {
        assert!(p("/a/b").starts_with(&p("/a")));
        assert!(p("/a").starts_with(&p("/a")));
        assert!(!p("/ab").starts_with(&p("/a")));
        assert!(p("/ab").starts_with(&AbsPath::root()));
        assert!(p("/a").is_ancestor_of(&p("/a/b")));
        assert!(!p("/a").is_ancestor_of(&p("/a")));
    }

    #[test]
    fn rebase_moves_subtree() {
        assert_eq!(
            p("/a/b/c").rebase(&p("/a"), &p("/x/y")).unwrap().as_str(),
            "/x/y/b/c"
        );
        assert_eq!(p("/a").rebase(&p("/a"), &p("/z")).unwrap().as_str(), "/z");
        assert_eq!(p("/a/b").rebase(&p("/a"), &AbsPath::root()).unwrap().as_str(), "/b");
        assert!(p("/q").rebase(&p("/a"), &p("/z")).is_none());
    }

    #[test]
    fn relative_to_base() {
        assert_eq!(p("/a/b/c").relative_to(&p("/a")), Some("b/c"));
        assert_eq!(p("/a/b").relative_to(&AbsPath::root()), Some("a/b"));
        assert_eq!(p("/a").relative_to(&p("/b")), None);
    }

    #[test]
    fn serde_round_trip_normalizes() {
        let parsed: AbsPath = serde_json::from_str("\"/a//b/\"").unwrap();
        assert_eq!(parsed.as_str(), "/a/b");
        assert!(serde_json::from_str::<AbsPath>("\"rel\"").is_err());
    }

    // ── encoding ────────────────────────────────────────────────────────

    #[test]
    fn encode_and_decode_segments() {
        let path = p("/my notes/50%?.md");
        let encoded = encode_path(&path);
        assert_eq!(encoded, "/my%20notes/50%25%3F.md");
        assert_eq!(decode_path(&encoded).unwrap(), path);
    }

    #[test]
    fn decode_rejects_encoded_slash() {
        assert!(decode_path("/a%2Fb").is_err());
    }

    // ── limits ──────────────────────────────────────────────────────────

    #[test]
    fn validate_limits() {
        let limits = PathLimits {
            max_path_depth: 2,
            max_name_length: 4,
            max_path_length: 64,
        };
        assert!(validate(&p("/a/b"), &limits).is_ok());
        assert!(validate(&p("/a/b/c"), &limits).is_err());
        assert!(validate(&p("/abcde"), &limits).is_err());
    }

    // ── reduce / special ────────────────────────────────────────────────

    #[test]
    fn reduce_drops_covered_paths() {
        let reduced = reduce_paths(&[p("/a/b"), p("/a"), p("/c"), p("/a/b/c"), p("/c")]);
        let reduced: Vec<&str> = reduced.iter().map(|p| p.as_str()).collect();
        assert_eq!(reduced, vec!["/a", "/c"]);
    }

    #[test]
    fn special_dirs() {
        assert_eq!(special_dir_of(&p("/.trash/a")), Some(SpecialDir::Trash));
        assert_eq!(special_dir_of(&p("/.git")), Some(SpecialDir::Git));
        assert_eq!(special_dir_of(&p("/.gitignore")), None);
        assert!(is_special(&p("/.storage/x")));
    }

    #[test]
    fn trash_paths() {
        assert_eq!(trash_path_for(&p("/a/b.md")).as_str(), "/.trash/a/b.md");
        assert_eq!(untrash_path_for(&p("/.trash/a/b.md")).unwrap().as_str(), "/a/b.md");
        assert!(untrash_path_for(&p("/.trash")).is_none());
        assert!(untrash_path_for(&p("/a")).is_none());
    }
}
