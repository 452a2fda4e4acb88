use std::collections::{BTreeSet, HashMap, HashSet};

use crate::project::graph::{EntityGraph, EntityKind, TreeEntry};

/// Tri-state mark for one node. `Unset` and `Deselected` differ for styles:
/// styles of a retained layer default to retained unless explicitly
/// deselected, and a theme can still pin a deselected style back in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mark {
    #[default]
    Unset,
    Selected,
    Deselected,
}

/// Composite identifier for a style, owned by its layer.
pub fn style_key(layer: &str, style: &str) -> String {
    format!("{}|{}", layer, style)
}

pub fn split_style_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('|')
}

/// Selection record for one pass over a loaded project. Holds identifier
/// references only; the graph must outlive every state built against it.
#[derive(Clone, Debug, Default)]
pub struct SelectionState {
    marks: HashMap<(EntityKind, String), Mark>,
    journal: Vec<(EntityKind, String, bool)>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one user action and cascade it. Returns every node whose
    /// effective flag changed, so a presentation layer can update without the
    /// core knowing anything about it.
    pub fn set(
        &mut self,
        graph: &EntityGraph,
        kind: EntityKind,
        id: &str,
        selected: bool,
    ) -> Vec<(EntityKind, String)> {
        let before = self.effective_map(graph);
        self.journal.push((kind, id.to_string(), selected));
        let mark = if selected { Mark::Selected } else { Mark::Deselected };
        self.marks.insert((kind, id.to_string()), mark);
        if kind == EntityKind::Group {
            // Cascades down only; marking a child never touches its ancestors.
            let (groups, layers) = graph.group_descendants(id);
            for g in groups {
                self.marks.insert((EntityKind::Group, g), mark);
            }
            for l in layers {
                self.marks.insert((EntityKind::Layer, l), mark);
            }
        }
        let after = self.effective_map(graph);
        let mut changed: Vec<(EntityKind, String)> = Vec::new();
        for (node, flag) in &after {
            if before.get(node) != Some(flag) {
                changed.push(node.clone());
            }
        }
        changed
    }

    pub fn is_selected(&self, graph: &EntityGraph, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::Layer => self.layer_selected(graph, id),
            EntityKind::Style => self.style_selected(graph, id),
            _ => self.mark(kind, id) == Mark::Selected,
        }
    }

    pub fn selected_ids(&self, graph: &EntityGraph, kind: EntityKind) -> BTreeSet<String> {
        self.effective_map(graph)
            .into_iter()
            .filter(|((k, _), flag)| *k == kind && *flag)
            .map(|((_, id), _)| id)
            .collect()
    }

    /// Explicit user mark, ignoring propagation from themes.
    pub fn mark(&self, kind: EntityKind, id: &str) -> Mark {
        self.marks.get(&(kind, id.to_string())).copied().unwrap_or(Mark::Unset)
    }

    /// The `set` calls of this pass, in application order.
    pub fn journal(&self) -> &[(EntityKind, String, bool)] {
        &self.journal
    }

    pub fn clear(&mut self) {
        self.marks.clear();
        self.journal.clear();
    }

    /// Select every entity in the graph.
    pub fn select_all(&mut self, graph: &EntityGraph) {
        for root in &graph.roots {
            match root {
                TreeEntry::Group(g) => {
                    self.set(graph, EntityKind::Group, g, true);
                }
                TreeEntry::Layer(l) => {
                    self.set(graph, EntityKind::Layer, l, true);
                }
            }
        }
        // Layers defined outside the tree still count.
        for layer in &graph.layers {
            if !self.layer_selected(graph, &layer.id) {
                self.set(graph, EntityKind::Layer, &layer.id, true);
            }
        }
        for theme in &graph.themes {
            self.set(graph, EntityKind::Theme, &theme.name, true);
        }
        for layout in &graph.layouts {
            self.set(graph, EntityKind::Layout, &layout.name, true);
        }
        for rel in &graph.relations {
            self.set(graph, EntityKind::Relation, &rel.name, true);
        }
    }

    pub(crate) fn force_selected(&mut self, kind: EntityKind, id: &str) {
        self.marks.insert((kind, id.to_string()), Mark::Selected);
    }

    // Union semantics: a layer is selected if any of its paths is active.
    fn layer_selected(&self, graph: &EntityGraph, id: &str) -> bool {
        if self.mark(EntityKind::Layer, id) == Mark::Selected {
            return true;
        }
        self.theme_selected_layers(graph).contains(id)
    }

    fn style_selected(&self, graph: &EntityGraph, key: &str) -> bool {
        let Some((layer, style)) = split_style_key(key) else {
            return false;
        };
        if !self.layer_selected(graph, layer) {
            return false;
        }
        if self.mark(EntityKind::Style, key) != Mark::Deselected {
            return true;
        }
        // A selected theme pinning this exact style wins over the deselection.
        self.theme_pinned_styles(graph).contains(&(layer.to_string(), style.to_string()))
    }

    /// Layers referenced by at least one selected theme.
    fn theme_selected_layers(&self, graph: &EntityGraph) -> HashSet<String> {
        let mut out = HashSet::new();
        for theme in &graph.themes {
            if self.mark(EntityKind::Theme, &theme.name) != Mark::Selected {
                continue;
            }
            for entry in &theme.entries {
                if graph.layer(&entry.layer).is_some() {
                    out.insert(entry.layer.clone());
                }
            }
        }
        out
    }

    /// (layer, style) pairs pinned retained by selected themes. An entry with
    /// no style name pins the layer's current style.
    fn theme_pinned_styles(&self, graph: &EntityGraph) -> HashSet<(String, String)> {
        let mut out = HashSet::new();
        for theme in &graph.themes {
            if self.mark(EntityKind::Theme, &theme.name) != Mark::Selected {
                continue;
            }
            for entry in &theme.entries {
                let Some(layer) = graph.layer(&entry.layer) else { continue };
                let style = if entry.style.is_empty() {
                    layer.current_style.clone()
                } else {
                    entry.style.clone()
                };
                out.insert((entry.layer.clone(), style));
            }
        }
        out
    }

    /// Effective flag of every node the graph knows, in graph order.
    fn effective_map(&self, graph: &EntityGraph) -> HashMap<(EntityKind, String), bool> {
        let theme_layers = self.theme_selected_layers(graph);
        let pinned = self.theme_pinned_styles(graph);
        let mut out = HashMap::new();
        for layer in &graph.layers {
            let layer_on = self.mark(EntityKind::Layer, &layer.id) == Mark::Selected
                || theme_layers.contains(&layer.id);
            out.insert((EntityKind::Layer, layer.id.clone()), layer_on);
            for style in &layer.styles {
                let key = style_key(&layer.id, &style.name);
                let on = layer_on
                    && (self.mark(EntityKind::Style, &key) != Mark::Deselected
                        || pinned.contains(&(layer.id.clone(), style.name.clone())));
                out.insert((EntityKind::Style, key), on);
            }
        }
        for group in &graph.groups {
            let on = self.mark(EntityKind::Group, &group.id) == Mark::Selected;
            out.insert((EntityKind::Group, group.id.clone()), on);
        }
        for theme in &graph.themes {
            let on = self.mark(EntityKind::Theme, &theme.name) == Mark::Selected;
            out.insert((EntityKind::Theme, theme.name.clone()), on);
        }
        for layout in &graph.layouts {
            let on = self.mark(EntityKind::Layout, &layout.name) == Mark::Selected;
            out.insert((EntityKind::Layout, layout.name.clone()), on);
        }
        for rel in &graph.relations {
            let on = self.mark(EntityKind::Relation, &rel.name) == Mark::Selected;
            out.insert((EntityKind::Relation, rel.name.clone()), on);
        }
        out
    }
}
