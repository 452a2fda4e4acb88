use log::debug;

use crate::project::graph::{EntityGraph, EntityKind};

use super::state::SelectionState;

/// Auto-select relations whose two endpoint layers are both selected by any
/// path. Runs once, after user selection and before filtering. Forcing wins
/// over an explicit deselection; everything else keeps the user's mark, and
/// unresolved relations are never touched.
pub fn auto_select_relations(graph: &EntityGraph, selection: &mut SelectionState) -> Vec<String> {
    let layers = selection.selected_ids(graph, EntityKind::Layer);
    let mut forced = Vec::new();
    for rel in &graph.relations {
        if !graph.relation_resolved(rel) {
            continue;
        }
        if layers.contains(&rel.parent_layer)
            && layers.contains(&rel.child_layer)
            && !selection.is_selected(graph, EntityKind::Relation, &rel.name)
        {
            selection.force_selected(EntityKind::Relation, &rel.name);
            forced.push(rel.name.clone());
        }
    }
    if !forced.is_empty() {
        debug!("auto-selected {} relation(s): {}", forced.len(), forced.join(", "));
    }
    forced
}
