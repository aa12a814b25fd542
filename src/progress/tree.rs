use super::render::{Renderer, WidgetId};

/// Owned rendering handle. A node owns its children; closing it closes
/// the whole subtree, children first.
#[derive(Debug)]
pub struct BarNode {
    widget: WidgetId,
    children: Vec<BarNode>,
}

impl BarNode {
    pub fn new(widget: WidgetId) -> Self {
        Self { widget, children: Vec::new() }
    }

    pub fn widget(&self) -> WidgetId {
        self.widget
    }

    pub fn push(&mut self, child: BarNode) -> WidgetId {
        let id = child.widget;
        self.children.push(child);
        id
    }

    pub fn children(&self) -> &[BarNode] {
        &self.children
    }

    /// Every widget id of the subtree, parent before children.
    pub fn widgets(&self) -> Vec<WidgetId> {
        let mut out = vec![self.widget];
        for c in &self.children {
            out.extend(c.widgets());
        }
        out
    }

    pub fn close(self, renderer: &dyn Renderer) {
        for child in self.children.into_iter().rev() {
            child.close(renderer);
        }
        renderer.abort(self.widget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::render::{MemoryRenderer, WidgetKind};

    #[test]
    fn close_releases_whole_subtree() {
        let r = MemoryRenderer::new();
        let mut root = BarNode::new(r.create(WidgetKind::Spinner, "Current repository: a"));
        let mut phase = BarNode::new(r.create(WidgetKind::Headline, "Phase 1"));
        phase.push(BarNode::new(r.create(WidgetKind::Bytes, "Storage")));
        phase.push(BarNode::new(r.create(WidgetKind::Tasks, "Files")));
        root.push(phase);
        let keep = BarNode::new(r.create(WidgetKind::Value, "Working threads: "));

        assert_eq!(root.widgets().len(), 4);
        root.close(&r);
        assert_eq!(r.live().len(), 1);
        assert_eq!(r.live()[0].label, "Working threads: ");
        keep.close(&r);
        assert!(r.live().is_empty());
    }
}
