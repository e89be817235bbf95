//! Call-stack capture for tracked queries
//!
//! Frames are walked with [`backtrace::trace`] and resolved one at a time
//! through [`backtrace::resolve_frame`], so capture stops as soon as
//! `limit` frames have been kept. Toolchain, dependency and instrumentation
//! frames are dropped, the project root is stripped from file paths and
//! frames without debug info keep their symbol only.
//!
//! Origin detection picks the first frame that looks like application data
//! access code. What counts as "data access" is a pluggable predicate
//! ([`OriginMatcher`]) because it depends on how the host lays out modules.

use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::config::BacktraceConfig;
use crate::record::Frame;

/// Symbols of the instrumentation itself; never reported as query call sites
const INTERNAL_SYMBOL_PREFIXES: &[&str] = &[
    "querylens::backtrace::BacktraceCollector",
    "querylens::aggregator::RequestAggregator",
    "querylens::aggregator::RequestScope",
    "querylens::aggregator::registry::RequestRegistry",
    "querylens::engine::QueryLens",
    "backtrace::",
];

/// Runtime and standard library symbols, dropped even without a file path
const TOOLCHAIN_SYMBOL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "test::",
    "<std::",
    "<core::",
    "<alloc::",
    "__rust",
    "__libc",
    "_start",
    "_Unwind",
];

const DEFAULT_ORIGIN_PATTERN: &str = r"(?i)::repositor(y|ies)::|::services?::|Repository$|Service$";

/// Resolved frame, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Demangled symbol without the compiler hash suffix
    pub symbol: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl RawFrame {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Unnamed symbols carry nothing to match on and yield `None`
    fn from_symbol(symbol: &::backtrace::Symbol) -> Option<Self> {
        let name = symbol.name()?;
        Some(Self {
            // alternate formatting drops the `::h<hash>` suffix
            symbol: format!("{:#}", name),
            file: symbol
                .filename()
                .map(|path| path.to_string_lossy().into_owned()),
            line: symbol.lineno(),
        })
    }
}

/// Split `a::b::Type::method` into (`a::b::Type`, `method`)
///
/// Separators inside `<...>` (trait impls, generics) are not split points.
pub fn split_symbol(symbol: &str) -> (Option<String>, String) {
    let bytes = symbol.as_bytes();
    let mut depth = 0i32;
    let mut split_at = None;

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth -= 1,
            b':' if depth == 0 && i + 1 < bytes.len() && bytes[i + 1] == b':' => {
                split_at = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    match split_at {
        Some(idx) if idx > 0 => (
            Some(symbol[..idx].to_string()),
            symbol[idx + 2..].to_string(),
        ),
        _ => (None, symbol.to_string()),
    }
}

/// Predicate deciding whether a frame is the application code that issued
/// a query
#[derive(Clone)]
pub struct OriginMatcher {
    predicate: Arc<dyn Fn(&Frame) -> bool + Send + Sync>,
}

impl OriginMatcher {
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Match frames whose class path matches `pattern`
    pub fn from_regex(pattern: &str) -> Result<Self, regex::Error> {
        let re = Regex::new(pattern)?;
        Ok(Self::from_fn(move |frame| {
            frame.class.as_deref().map(|c| re.is_match(c)).unwrap_or(false)
        }))
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        (self.predicate)(frame)
    }
}

impl Default for OriginMatcher {
    fn default() -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(DEFAULT_ORIGIN_PATTERN).expect("valid origin regex"));
        Self::from_fn(move |frame| {
            frame.class.as_deref().map(|c| re.is_match(c)).unwrap_or(false)
        })
    }
}

impl fmt::Debug for OriginMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginMatcher").finish_non_exhaustive()
    }
}

fn qualified_name(frame: &Frame) -> Option<String> {
    let function = frame.function.as_deref()?;
    Some(match frame.class.as_deref() {
        Some(class) => format!("{}::{}", class, function),
        None => function.to_string(),
    })
}

/// `Class::function` of the first frame the matcher accepts
pub fn find_origin(frames: &[Frame], matcher: &OriginMatcher) -> Option<String> {
    frames
        .iter()
        .find(|frame| matcher.matches(frame))
        .and_then(qualified_name)
}

/// `Class::function (file:line)` of the first frame the matcher accepts
///
/// Frames without a resolved location yield the bare `Class::function`.
pub fn find_origin_location(frames: &[Frame], matcher: &OriginMatcher) -> Option<String> {
    let frame = frames.iter().find(|frame| matcher.matches(frame))?;
    let name = qualified_name(frame)?;
    Some(match (&frame.file, frame.line) {
        (Some(file), Some(line)) => format!("{} ({}:{})", name, file, line),
        (Some(file), None) => format!("{} ({})", name, file),
        _ => name,
    })
}

/// Captures and filters call stacks
#[derive(Debug, Clone)]
pub struct BacktraceCollector {
    enabled: bool,
    limit: usize,
    exclude_paths: Vec<String>,
    project_root: Option<String>,
}

impl BacktraceCollector {
    pub fn new(config: &BacktraceConfig) -> Self {
        let root = config
            .project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|p: PathBuf| p.to_string_lossy().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Self {
            enabled: config.enabled,
            limit: config.limit,
            exclude_paths: config.exclude_paths.clone(),
            project_root: root,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot the current call stack
    ///
    /// Returns an empty list when capture is disabled. The walk stops once
    /// `limit` frames survive filtering.
    pub fn collect(&self) -> Vec<Frame> {
        if !self.enabled || self.limit == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(self.limit);
        ::backtrace::trace(|frame| {
            // inlined calls resolve to several symbols for one frame
            ::backtrace::resolve_frame(frame, |symbol| {
                if frames.len() >= self.limit {
                    return;
                }
                if let Some(kept) = RawFrame::from_symbol(symbol).and_then(|raw| self.keep(raw)) {
                    frames.push(kept);
                }
            });
            frames.len() < self.limit
        });
        frames
    }

    /// Apply [`Self::keep`] to every frame and cap at the configured limit
    pub fn filter_frames(&self, raw: Vec<RawFrame>) -> Vec<Frame> {
        raw.into_iter()
            .filter_map(|frame| self.keep(frame))
            .take(self.limit)
            .collect()
    }

    /// Drop internal and toolchain symbols and excluded paths, make the
    /// path project-relative and split the symbol
    fn keep(&self, frame: RawFrame) -> Option<Frame> {
        let symbol = frame.symbol.as_str();
        if INTERNAL_SYMBOL_PREFIXES
            .iter()
            .chain(TOOLCHAIN_SYMBOL_PREFIXES)
            .any(|prefix| symbol.starts_with(prefix))
            || symbol == "main"
        {
            return None;
        }

        if let Some(file) = &frame.file {
            if self.exclude_paths.iter().any(|p| file.contains(p.as_str())) {
                return None;
            }
        }

        let (class, function) = split_symbol(symbol);
        Some(Frame {
            file: frame.file.map(|file| self.relative_path(&file)),
            line: frame.line,
            class,
            function: Some(function),
        })
    }

    fn relative_path(&self, file: &str) -> String {
        let stripped = match &self.project_root {
            Some(root) => file.strip_prefix(root.as_str()).unwrap_or(file),
            None => file,
        };
        stripped
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string()
    }
}
