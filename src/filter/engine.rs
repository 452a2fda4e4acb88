use std::collections::BTreeSet;

use log::debug;

use crate::project::graph::{EntityGraph, EntityKind, Group, Theme, TreeEntry};
use crate::selection::state::{SelectionState, style_key};

/// Locator written into every retained layer when sources are disconnected,
/// so the exported project reports its data as missing on next open.
pub const DISCONNECTED_SOURCE: &str = "./unavailable";

#[derive(Clone, Copy, Debug, Default)]
pub struct FilterOptions {
    pub disconnect_sources: bool,
}

/// Produce a new pruned graph from a loaded graph and a resolved selection.
/// The input graph is never mutated; an empty selection yields a valid,
/// schema-complete empty project.
pub fn filter_graph(
    graph: &EntityGraph,
    selection: &SelectionState,
    opts: FilterOptions,
) -> EntityGraph {
    let retained_layers: BTreeSet<String> = selection.selected_ids(graph, EntityKind::Layer);

    let mut out = EntityGraph::new();
    out.meta = graph.meta.clone();
    out.source_xml = graph.source_xml.clone();
    out.aux_resources = graph.aux_resources.clone();

    // Layers, with styles narrowed. Styles default to retained and drop only
    // on explicit deselection; a layer never ends up with zero styles.
    for layer in &graph.layers {
        if !retained_layers.contains(&layer.id) {
            continue;
        }
        let mut kept: Vec<_> = layer
            .styles
            .iter()
            .filter(|s| {
                selection.is_selected(graph, EntityKind::Style, &style_key(&layer.id, &s.name))
            })
            .cloned()
            .collect();
        if kept.is_empty() {
            let fallback = layer
                .styles
                .iter()
                .find(|s| s.name == layer.current_style)
                .or_else(|| layer.styles.first());
            kept.extend(fallback.cloned());
        }
        let current_style = if kept.iter().any(|s| s.name == layer.current_style) {
            layer.current_style.clone()
        } else {
            kept.first().map(|s| s.name.clone()).unwrap_or_default()
        };
        let source = if opts.disconnect_sources {
            Some(DISCONNECTED_SOURCE.to_string())
        } else {
            layer.source.clone()
        };
        let mut layer = layer.clone();
        layer.styles = kept;
        layer.current_style = current_style;
        layer.source = source;
        layer.parent_group = None;
        out.add_layer(layer);
    }

    // The tree: a group survives when directly selected or when anything
    // below it survived, keeping the path to every retained leaf navigable.
    let mut groups: Vec<Group> = Vec::new();
    let roots: Vec<TreeEntry> = graph
        .roots
        .iter()
        .filter_map(|entry| prune_entry(graph, selection, entry, &retained_layers, &mut groups))
        .collect();
    for group in groups {
        out.add_group(group);
    }
    out.roots = roots;
    let memberships: Vec<(String, String)> = out
        .groups
        .iter()
        .flat_map(|g| {
            g.children.iter().filter_map(|c| match c {
                TreeEntry::Layer(l) => Some((l.clone(), g.id.clone())),
                TreeEntry::Group(_) => None,
            })
        })
        .collect();
    for (lid, gid) in memberships {
        if let Some(layer) = out.layer_mut(&lid) {
            layer.parent_group = Some(gid);
        }
    }

    // Themes: only the directly selected ones, narrowed to retained layers
    // and styles; a theme narrowed down to nothing is dropped outright.
    for theme in &graph.themes {
        if !selection.is_selected(graph, EntityKind::Theme, &theme.name) {
            continue;
        }
        let entries: Vec<_> = theme
            .entries
            .iter()
            .filter(|entry| {
                if !retained_layers.contains(&entry.layer) {
                    return false;
                }
                entry.style.is_empty()
                    || out
                        .layer(&entry.layer)
                        .is_some_and(|l| l.styles.iter().any(|s| s.name == entry.style))
            })
            .cloned()
            .collect();
        if !entries.is_empty() {
            out.themes.push(Theme { name: theme.name.clone(), entries });
        }
    }

    for layout in &graph.layouts {
        if selection.is_selected(graph, EntityKind::Layout, &layout.name) {
            out.layouts.push(layout.clone());
        }
    }

    // A relation needs its post-resolution flag AND both surviving endpoints;
    // a dangling relation is structurally invalid no matter what its flag says.
    for rel in &graph.relations {
        if selection.is_selected(graph, EntityKind::Relation, &rel.name)
            && retained_layers.contains(&rel.parent_layer)
            && retained_layers.contains(&rel.child_layer)
        {
            out.relations.push(rel.clone());
        }
    }

    debug!(
        "filtered project: {}/{} layers, {}/{} groups, {}/{} themes, {}/{} layouts, {}/{} relations",
        out.layers.len(),
        graph.layers.len(),
        out.groups.len(),
        graph.groups.len(),
        out.themes.len(),
        graph.themes.len(),
        out.layouts.len(),
        graph.layouts.len(),
        out.relations.len(),
        graph.relations.len(),
    );
    out
}

fn prune_entry(
    graph: &EntityGraph,
    selection: &SelectionState,
    entry: &TreeEntry,
    retained_layers: &BTreeSet<String>,
    out: &mut Vec<Group>,
) -> Option<TreeEntry> {
    match entry {
        TreeEntry::Layer(id) => retained_layers.contains(id).then(|| entry.clone()),
        TreeEntry::Group(id) => {
            let group = graph.group(id)?;
            let children: Vec<TreeEntry> = group
                .children
                .iter()
                .filter_map(|c| prune_entry(graph, selection, c, retained_layers, out))
                .collect();
            let keep = selection.is_selected(graph, EntityKind::Group, id) || !children.is_empty();
            if keep {
                out.push(Group { id: group.id.clone(), name: group.name.clone(), children });
                Some(TreeEntry::Group(group.id.clone()))
            } else {
                None
            }
        }
    }
}
