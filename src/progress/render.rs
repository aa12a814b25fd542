//! Rendering backends. The orchestrator only emits abstract directives;
//! how (and whether) they reach a terminal is decided here.

use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use crate::util::try_enable_ansi_on_windows;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WidgetKind {
    /// Static line of text.
    Headline,
    /// Text line with an activity spinner.
    Spinner,
    /// Count of completed tasks out of a total.
    Tasks,
    /// Byte progress out of a total size.
    Bytes,
    /// `label` followed by a free-form value.
    Value,
}

pub trait Renderer: Send + Sync {
    /// Whether output can be shown at all (e.g. a terminal is attached).
    fn is_available(&self) -> bool;
    fn create(&self, kind: WidgetKind, label: &str) -> WidgetId;
    fn set_total(&self, id: WidgetId, total: u64);
    fn set_position(&self, id: WidgetId, position: u64);
    fn set_message(&self, id: WidgetId, message: &str);
    /// Mark complete, leaving the final state visible.
    fn finish(&self, id: WidgetId);
    /// Remove the widget. Unknown or already removed ids are ignored.
    fn abort(&self, id: WidgetId);
    /// Block until every directive issued so far has been drawn.
    fn wait_idle(&self);
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|e| {
        tracing::warn!("invalid progress template {:?}: {}", template, e);
        ProgressStyle::default_bar()
    })
}

/// Terminal renderer on top of an indicatif `MultiProgress` drawing to stderr.
pub struct IndicatifRenderer {
    mp: MultiProgress,
    bars: Mutex<HashMap<WidgetId, ProgressBar>>,
    next: AtomicU64,
    color: bool,
}

impl Default for IndicatifRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifRenderer {
    pub fn new() -> Self {
        let color = try_enable_ansi_on_windows() || std::io::stderr().is_terminal();
        Self { mp: MultiProgress::new(), bars: Mutex::new(HashMap::new()), next: AtomicU64::new(0), color }
    }

    fn with_bar(&self, id: WidgetId, f: impl FnOnce(&ProgressBar)) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = bars.get(&id) {
            f(pb);
        }
    }
}

impl Renderer for IndicatifRenderer {
    fn is_available(&self) -> bool {
        std::io::stderr().is_terminal() && !self.mp.is_hidden()
    }

    fn create(&self, kind: WidgetKind, label: &str) -> WidgetId {
        let id = WidgetId(self.next.fetch_add(1, Ordering::SeqCst));
        let pb = match kind {
            WidgetKind::Headline => {
                let pb = ProgressBar::new(0);
                pb.set_style(style("{prefix}{msg}"));
                pb
            }
            WidgetKind::Spinner => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(style("{spinner:.green} {prefix}{msg}"));
                pb.enable_steady_tick(Duration::from_millis(120));
                pb
            }
            WidgetKind::Tasks => {
                let pb = ProgressBar::new(0);
                pb.set_style(style("{prefix:<14} [{bar:40.green/white}] {pos}/{len} {msg}").progress_chars("=> "));
                pb
            }
            WidgetKind::Bytes => {
                let pb = ProgressBar::new(0);
                pb.set_style(
                    style("{prefix:<14} [{bar:40.green/white}] {bytes}/{total_bytes} {msg}").progress_chars("=> "),
                );
                pb
            }
            WidgetKind::Value => {
                let pb = ProgressBar::new(0);
                pb.set_style(style("{prefix}{msg}"));
                pb
            }
        };
        let prefix = if self.color && matches!(kind, WidgetKind::Headline | WidgetKind::Spinner) {
            label.green().to_string()
        } else {
            label.to_string()
        };
        pb.set_prefix(prefix);
        let pb = self.mp.add(pb);
        pb.tick();
        self.bars.lock().unwrap_or_else(PoisonError::into_inner).insert(id, pb);
        id
    }

    fn set_total(&self, id: WidgetId, total: u64) {
        self.with_bar(id, |pb| pb.set_length(total));
    }

    fn set_position(&self, id: WidgetId, position: u64) {
        self.with_bar(id, |pb| pb.set_position(position));
    }

    fn set_message(&self, id: WidgetId, message: &str) {
        let message = message.to_string();
        self.with_bar(id, |pb| pb.set_message(message));
    }

    fn finish(&self, id: WidgetId) {
        self.with_bar(id, |pb| pb.finish());
    }

    fn abort(&self, id: WidgetId) {
        let removed = self.bars.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        if let Some(pb) = removed {
            pb.finish_and_clear();
            self.mp.remove(&pb);
        }
    }

    fn wait_idle(&self) {
        // indicatif draws synchronously; finished tickers are already joined
        let _ = self.mp.clear();
    }
}

/// Renderer for runs without a terminal: directives become log events.
#[derive(Default)]
pub struct HeadlessRenderer {
    labels: Mutex<HashMap<WidgetId, String>>,
    next: AtomicU64,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn label(&self, id: WidgetId) -> String {
        self.labels.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned().unwrap_or_default()
    }
}

impl Renderer for HeadlessRenderer {
    fn is_available(&self) -> bool {
        true
    }

    fn create(&self, kind: WidgetKind, label: &str) -> WidgetId {
        let id = WidgetId(self.next.fetch_add(1, Ordering::SeqCst));
        self.labels.lock().unwrap_or_else(PoisonError::into_inner).insert(id, label.to_string());
        match kind {
            WidgetKind::Headline | WidgetKind::Spinner if !label.is_empty() => tracing::info!("{}", label),
            _ => tracing::debug!("[progress] create {:?} {:?}", kind, label),
        }
        id
    }

    fn set_total(&self, id: WidgetId, total: u64) {
        tracing::debug!("[progress] {} total={}", self.label(id), total);
    }

    fn set_position(&self, id: WidgetId, position: u64) {
        tracing::debug!("[progress] {} position={}", self.label(id), position);
    }

    fn set_message(&self, id: WidgetId, message: &str) {
        tracing::debug!("[progress] {}{}", self.label(id), message);
    }

    fn finish(&self, id: WidgetId) {
        tracing::debug!("[progress] {} finished", self.label(id));
    }

    fn abort(&self, id: WidgetId) {
        self.labels.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    fn wait_idle(&self) {}
}

/// Recorded state of one widget in a [`MemoryRenderer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WidgetState {
    pub kind: WidgetKind,
    pub label: String,
    pub total: u64,
    pub position: u64,
    pub message: String,
    /// Number of `finish` directives received.
    pub finished: u32,
    pub aborted: bool,
}

/// In-memory renderer that records every directive for inspection.
pub struct MemoryRenderer {
    widgets: Mutex<BTreeMap<WidgetId, WidgetState>>,
    next: AtomicU64,
    available: AtomicBool,
    idle_waits: AtomicU64,
}

impl Default for MemoryRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self {
            widgets: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0),
            available: AtomicBool::new(true),
            idle_waits: AtomicU64::new(0),
        }
    }

    /// A renderer reporting that no display is attached.
    pub fn unavailable() -> Self {
        let r = Self::new();
        r.available.store(false, Ordering::SeqCst);
        r
    }

    pub fn widgets(&self) -> Vec<WidgetState> {
        self.widgets.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn created(&self) -> usize {
        self.widgets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Widgets not yet aborted.
    pub fn live(&self) -> Vec<WidgetState> {
        self.widgets().into_iter().filter(|w| !w.aborted).collect()
    }

    /// Most recently created live widget whose label starts with `prefix`.
    pub fn find_live(&self, prefix: &str) -> Option<WidgetState> {
        self.live().into_iter().rev().find(|w| w.label.starts_with(prefix))
    }

    pub fn count_live(&self, prefix: &str) -> usize {
        self.live().iter().filter(|w| w.label.starts_with(prefix)).count()
    }

    pub fn idle_waits(&self) -> u64 {
        self.idle_waits.load(Ordering::SeqCst)
    }

    fn update(&self, id: WidgetId, f: impl FnOnce(&mut WidgetState)) {
        let mut widgets = self.widgets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = widgets.get_mut(&id)
            && !w.aborted
        {
            f(w);
        }
    }
}

impl Renderer for MemoryRenderer {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn create(&self, kind: WidgetKind, label: &str) -> WidgetId {
        let id = WidgetId(self.next.fetch_add(1, Ordering::SeqCst));
        let state = WidgetState {
            kind,
            label: label.to_string(),
            total: 0,
            position: 0,
            message: String::new(),
            finished: 0,
            aborted: false,
        };
        self.widgets.lock().unwrap_or_else(PoisonError::into_inner).insert(id, state);
        id
    }

    fn set_total(&self, id: WidgetId, total: u64) {
        self.update(id, |w| w.total = total);
    }

    fn set_position(&self, id: WidgetId, position: u64) {
        self.update(id, |w| w.position = position);
    }

    fn set_message(&self, id: WidgetId, message: &str) {
        self.update(id, |w| w.message = message.to_string());
    }

    fn finish(&self, id: WidgetId) {
        self.update(id, |w| w.finished += 1);
    }

    fn abort(&self, id: WidgetId) {
        self.update(id, |w| w.aborted = true);
    }

    fn wait_idle(&self) {
        self.idle_waits.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_renderer_ignores_directives_after_abort() {
        let r = MemoryRenderer::new();
        let id = r.create(WidgetKind::Tasks, "Files");
        r.set_total(id, 10);
        r.set_position(id, 4);
        r.abort(id);
        r.set_position(id, 9);
        let w = &r.widgets()[0];
        assert_eq!((w.total, w.position, w.aborted), (10, 4, true));
        assert!(r.find_live("Files").is_none());
    }

    #[test]
    fn headless_renderer_accepts_everything() {
        let r = HeadlessRenderer::new();
        assert!(r.is_available());
        let id = r.create(WidgetKind::Value, "Transfer failures: ");
        r.set_message(id, "2");
        r.finish(id);
        r.abort(id);
        r.abort(id);
        r.wait_idle();
    }
}
