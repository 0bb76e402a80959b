//! Captured errors that can travel through callback chains.
//!
//! A [`FailureValue`] freezes an error at the point it happened: the
//! [`ErrorKind`] tag, the error value itself, and a stack of captured
//! [`Frame`]s. It is the failure branch of every Deferred chain and the
//! `reason` handed to `connection_lost`.

use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ErrorKind, KairoError};

static CAPTURE_COUNT: AtomicU64 = AtomicU64::new(0);

/// One captured stack frame.
///
/// `locals` and `globals` hold rendered name/value snapshots; values are
/// stringified at capture time so the frame never keeps live objects
/// reachable.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub locals: Vec<(String, String)>,
    pub globals: Vec<(String, String)>,
}

impl Frame {
    fn here(function: &str, location: &Location<'_>) -> Frame {
        Frame {
            function: function.to_string(),
            file: location.file().to_string(),
            line: location.line(),
            locals: Vec::new(),
            globals: Vec::new(),
        }
    }
}

/// Rendering density for tracebacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detail {
    Brief,
    Default,
    Verbose,
}

struct FailureInner {
    kind: ErrorKind,
    error: Box<dyn Error + Send + Sync>,
    frames: RefCell<Vec<Frame>>,
    cleaned: Cell<bool>,
    count: u64,
}

/// An immutable record of an error: kind tag, value and captured frames.
///
/// `FailureValue` is a cheap handle (clone shares the record) and compares
/// by identity via [`ptr_eq`](FailureValue::ptr_eq). It is created where the
/// error happens, passed by reference through Deferred chains, and never
/// mutated apart from [`clean`](FailureValue::clean).
#[derive(Clone)]
pub struct FailureValue {
    inner: Rc<FailureInner>,
}

impl FailureValue {
    /// Capture a failure with an explicit kind tag.
    ///
    /// The capture site (file and line) is recorded as the first frame.
    #[track_caller]
    pub fn new(kind: ErrorKind, error: impl Error + Send + Sync + 'static) -> FailureValue {
        FailureValue::boxed(kind, Box::new(error))
    }

    /// Capture a [`KairoError`], deriving the kind from the value.
    #[track_caller]
    pub fn from_error(error: KairoError) -> FailureValue {
        let kind = error.kind();
        FailureValue::boxed(kind, Box::new(error))
    }

    /// Capture an I/O error, mapping it onto the connection taxonomy.
    #[track_caller]
    pub fn from_io(error: std::io::Error) -> FailureValue {
        FailureValue::from_error(KairoError::from(error))
    }

    /// Build a failure from a bare string.
    ///
    /// Bare strings are a legacy construction path; the value is upgraded
    /// to a synthetic default error with an `Unknown` kind.
    #[track_caller]
    pub fn from_string(message: impl Into<String>) -> FailureValue {
        FailureValue::from_error(KairoError::Other(message.into()))
    }

    #[track_caller]
    fn boxed(kind: ErrorKind, error: Box<dyn Error + Send + Sync>) -> FailureValue {
        let location = Location::caller();
        let count = CAPTURE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        FailureValue {
            inner: Rc::new(FailureInner {
                kind,
                error,
                frames: RefCell::new(vec![Frame::here("<capture>", location)]),
                cleaned: Cell::new(false),
                count,
            }),
        }
    }

    /// Record an additional frame on top of the captured stack.
    #[track_caller]
    pub fn push_frame(&self, function: &str) -> &Self {
        let location = Location::caller();
        self.inner.frames.borrow_mut().push(Frame::here(function, location));
        self
    }

    /// Attach a rendered local-variable snapshot to the newest frame.
    pub fn with_local(&self, name: &str, value: impl fmt::Debug) -> &Self {
        if let Some(frame) = self.inner.frames.borrow_mut().last_mut() {
            frame.locals.push((name.to_string(), format!("{:?}", value)));
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn error(&self) -> &(dyn Error + Send + Sync) {
        self.inner.error.as_ref()
    }

    /// Monotonic capture counter, mostly useful in diagnostics.
    pub fn count(&self) -> u64 {
        self.inner.count
    }

    /// Identity comparison. Two handles are equal only if they share the
    /// same captured record.
    pub fn ptr_eq(&self, other: &FailureValue) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return the first of `kinds` that this failure is (directly or by
    /// widening). No side effects.
    pub fn check(&self, kinds: &[ErrorKind]) -> Option<ErrorKind> {
        kinds.iter().copied().find(|k| self.inner.kind.is(*k))
    }

    /// Like [`check`](FailureValue::check), but the failure is handed back
    /// for re-propagation when nothing matched. Intended for use inside
    /// errbacks:
    ///
    /// ```rust
    /// use kairo_core::error::ErrorKind;
    /// use kairo_core::failure::FailureValue;
    ///
    /// fn on_error(f: FailureValue) -> Result<(), FailureValue> {
    ///     let kind = f.trap(&[ErrorKind::Timeout])?;
    ///     assert_eq!(kind, ErrorKind::Timeout);
    ///     Ok(())
    /// }
    /// ```
    pub fn trap(&self, kinds: &[ErrorKind]) -> Result<ErrorKind, FailureValue> {
        self.check(kinds).ok_or_else(|| self.clone())
    }

    /// Get a string of the error which caused this failure.
    pub fn error_message(&self) -> String {
        self.inner.error.to_string()
    }

    /// Drop anything in the captured frames that could keep objects alive,
    /// leaving only rendered strings. Safe to call more than once.
    pub fn clean(&self) {
        if self.inner.cleaned.get() {
            return;
        }
        self.inner.cleaned.set(true);
    }

    pub fn is_cleaned(&self) -> bool {
        self.inner.cleaned.get()
    }

    fn format_frames(&self, w: &mut dyn fmt::Write, detail: Detail) -> fmt::Result {
        for frame in self.inner.frames.borrow().iter() {
            match detail {
                Detail::Brief => {
                    writeln!(w, "{}:{}:{}", frame.file, frame.line, frame.function)?;
                }
                Detail::Default => {
                    writeln!(w, "  File \"{}\", line {}, in {}", frame.file, frame.line, frame.function)?;
                }
                Detail::Verbose => {
                    writeln!(w, "{}:{}: {}(...)", frame.file, frame.line, frame.function)?;
                    writeln!(w, " [ Locals ]")?;
                    for (name, value) in &frame.locals {
                        writeln!(w, "  {} : {}", name, value)?;
                    }
                    writeln!(w, " ( Globals )")?;
                    for (name, value) in &frame.globals {
                        writeln!(w, "  {} : {}", name, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emulate the standard error reporting format.
    pub fn print_traceback(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "Traceback (most recent call last):")?;
        self.format_frames(w, Detail::Default)?;
        writeln!(w, "{}: {}", self.inner.kind, self.inner.error)
    }

    /// Print a traceback as densely as possible.
    pub fn print_brief_traceback(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "Traceback: {}, {}", self.inner.kind, self.inner.error)?;
        self.format_frames(w, Detail::Brief)
    }

    /// Print a traceback with locals and globals snapshots.
    pub fn print_detailed_traceback(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            w,
            "*--- Failure #{}{}---",
            self.inner.count,
            if self.inner.cleaned.get() { " (cleaned) " } else { " " }
        )?;
        self.format_frames(w, Detail::Verbose)?;
        writeln!(w, "{}: {}", self.inner.kind, self.inner.error)?;
        writeln!(w, "*--- End of Failure #{} ---", self.inner.count)
    }

    pub fn get_traceback(&self) -> String {
        let mut out = String::new();
        let _ = self.print_traceback(&mut out);
        out
    }

    pub fn get_brief_traceback(&self) -> String {
        let mut out = String::new();
        let _ = self.print_brief_traceback(&mut out);
        out
    }
}

impl fmt::Debug for FailureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<FailureValue #{} {}>", self.inner.count, self.inner.kind)
    }
}

impl fmt::Display for FailureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Failure instance: {}: {}]", self.inner.kind, self.inner.error)
    }
}
