use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

// Identifiers come from the loaded document; they are never generated here.
pub type LayerId = String;
pub type GroupId = String;

/// One named style variant of a layer. The payload is the raw markup of the
/// style definition, kept verbatim so it can be exported unmodified.
#[derive(Clone, Debug)]
pub struct Style {
    pub name: String,
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub provider: Option<String>,
    /// Source-data locator; may be absent or broken in the document.
    pub source: Option<String>,
    pub crs: Option<String>,
    /// Name of the style the layer currently renders with.
    pub current_style: String,
    pub styles: Vec<Style>,
    /// Containing group id, if the layer sits below a group in the tree.
    pub parent_group: Option<GroupId>,
}

/// A child slot in the layer tree, in document order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeEntry {
    Group(GroupId),
    Layer(LayerId),
}

#[derive(Clone, Debug)]
pub struct Group {
    /// Slash-joined path of group names from the tree root; unique per load.
    pub id: GroupId,
    pub name: String,
    pub children: Vec<TreeEntry>,
}

/// One (layer, style) pair inside a theme. An empty style name means the
/// theme uses the layer's default style.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThemeEntry {
    pub layer: LayerId,
    pub style: String,
}

#[derive(Clone, Debug)]
pub struct Theme {
    pub name: String,
    pub entries: Vec<ThemeEntry>,
}

/// A print layout. The composition payload is opaque to the engine and kept
/// verbatim for the rendering collaborator.
#[derive(Clone, Debug)]
pub struct Layout {
    pub name: String,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    /// Field on the parent (referenced) layer.
    pub referenced_field: String,
    /// Field on the child (referencing) layer.
    pub referencing_field: String,
}

#[derive(Clone, Debug)]
pub struct Relation {
    pub name: String,
    pub parent_layer: LayerId,
    pub child_layer: LayerId,
    pub fields: Vec<FieldRef>,
}

/// Entity kinds addressable by the selection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Layer,
    Group,
    Style,
    Theme,
    Layout,
    Relation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Layer => "layer",
            EntityKind::Group => "group",
            EntityKind::Style => "style",
            EntityKind::Theme => "theme",
            EntityKind::Layout => "layout",
            EntityKind::Relation => "relation",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "layer" => Ok(EntityKind::Layer),
            "group" => Ok(EntityKind::Group),
            "style" => Ok(EntityKind::Style),
            "theme" => Ok(EntityKind::Theme),
            "layout" => Ok(EntityKind::Layout),
            "relation" => Ok(EntityKind::Relation),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

/// Project-level metadata carried for the summary snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProjectMeta {
    pub version: Option<String>,
    pub save_user: Option<String>,
    pub save_date: Option<String>,
    pub crs_authid: Option<String>,
    pub crs_description: Option<String>,
    pub extent: Option<Extent>,
}

/// An auxiliary resource bundled alongside the markup in the archive
/// container (attachments, auxiliary storage, ...).
#[derive(Clone, Debug)]
pub struct AuxResource {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// In-memory project graph. Built once per load; the filter step produces a
/// new, separate graph rather than mutating this one.
#[derive(Clone, Debug, Default)]
pub struct EntityGraph {
    pub layers: Vec<Layer>,
    pub groups: Vec<Group>,
    pub themes: Vec<Theme>,
    pub layouts: Vec<Layout>,
    pub relations: Vec<Relation>,
    /// Top-level entries of the layer tree, in document order.
    pub roots: Vec<TreeEntry>,
    pub meta: ProjectMeta,
    /// The markup bytes this graph was loaded from. The serializer replays
    /// them minus pruned subtrees, which keeps untouched regions byte-similar.
    pub source_xml: Vec<u8>,
    /// Non-markup entries of the archive container, if the project came from one.
    pub aux_resources: Vec<AuxResource>,
    layer_index: HashMap<LayerId, usize>,
    group_index: HashMap<GroupId, usize>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layer_index.insert(layer.id.clone(), self.layers.len());
        self.layers.push(layer);
    }

    pub fn add_group(&mut self, group: Group) {
        self.group_index.insert(group.id.clone(), self.groups.len());
        self.groups.push(group);
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layer_index.get(id).map(|&i| &self.layers[i])
    }

    pub fn layer_mut(&mut self, id: &str) -> Option<&mut Layer> {
        self.layer_index.get(id).map(|&i| &mut self.layers[i])
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.group_index.get(id).map(|&i| &self.groups[i])
    }

    pub fn theme(&self, name: &str) -> Option<&Theme> {
        self.themes.iter().find(|t| t.name == name)
    }

    pub fn layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn style_count(&self) -> usize {
        self.layers.iter().map(|l| l.styles.len()).sum()
    }

    /// Both endpoints of the relation resolve to loaded layers. Relations
    /// failing this are inert: kept in the graph but never auto-selected.
    pub fn relation_resolved(&self, rel: &Relation) -> bool {
        self.layer(&rel.parent_layer).is_some() && self.layer(&rel.child_layer).is_some()
    }

    /// All groups and layers below a group, the group itself excluded.
    pub fn group_descendants(&self, id: &str) -> (Vec<GroupId>, Vec<LayerId>) {
        let mut groups = Vec::new();
        let mut layers = Vec::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(gid) = stack.pop() {
            let Some(group) = self.group(gid) else { continue };
            for child in &group.children {
                match child {
                    TreeEntry::Group(g) => {
                        groups.push(g.clone());
                        stack.push(g);
                    }
                    TreeEntry::Layer(l) => layers.push(l.clone()),
                }
            }
        }
        (groups, layers)
    }

    /// Style payload for the excluded context-menu collaborator, verbatim.
    pub fn style_payload(&self, layer_id: &str, style_name: &str) -> Option<&str> {
        self.layer(layer_id)?
            .styles
            .iter()
            .find(|s| s.name == style_name)
            .map(|s| s.payload.as_str())
    }

    /// Layout composition payload for the excluded rendering collaborator.
    pub fn layout_payload(&self, name: &str) -> Option<&str> {
        self.layout(name).map(|l| l.payload.as_str())
    }
}

/// Group id assignment shared by the loader and the serializer: both walk
/// the tree in document order, so colliding paths get the same suffixes.
pub(crate) fn unique_group_id(
    taken: &mut HashSet<String>,
    parent: Option<&str>,
    name: &str,
) -> String {
    let base = match parent {
        Some(p) => format!("{}/{}", p, name),
        None => name.to_string(),
    };
    let mut id = base.clone();
    let mut n = 1;
    while !taken.insert(id.clone()) {
        n += 1;
        id = format!("{}#{}", base, n);
    }
    id
}
