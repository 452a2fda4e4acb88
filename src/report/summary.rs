use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::project::graph::{EntityGraph, ProjectMeta, TreeEntry};

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct EntityCounts {
    pub layers: usize,
    pub groups: usize,
    pub styles: usize,
    pub themes: usize,
    pub layouts: usize,
    pub relations: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Group { name: String, children: Vec<TreeNode> },
    Layer { id: String, name: String, styles: Vec<String> },
}

#[derive(Clone, Debug, Serialize)]
pub struct ThemeLayerNode {
    pub id: String,
    pub name: String,
    /// Style names the theme pins; an empty name means the default style.
    pub styles: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ThemeNode {
    pub name: String,
    pub layers: Vec<ThemeLayerNode>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelationEnd {
    pub id: String,
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelationNode {
    pub name: String,
    pub parent: RelationEnd,
    pub child: RelationEnd,
}

/// Read-only snapshot handed to the report collaborator, which owns all
/// rendering. Counts, project metadata, and the full retained structure.
#[derive(Clone, Debug, Serialize)]
pub struct ProjectSummary {
    pub counts: EntityCounts,
    pub meta: ProjectMeta,
    pub layer_tree: Vec<TreeNode>,
    pub themes: Vec<ThemeNode>,
    pub relations: Vec<RelationNode>,
}

pub fn summarize(graph: &EntityGraph) -> ProjectSummary {
    let counts = EntityCounts {
        layers: graph.layers.len(),
        groups: graph.groups.len(),
        styles: graph.style_count(),
        themes: graph.themes.len(),
        layouts: graph.layouts.len(),
        relations: graph.relations.len(),
    };

    let layer_tree = graph.roots.iter().map(|e| tree_node(graph, e)).collect();

    let themes = graph
        .themes
        .iter()
        .map(|theme| {
            // Group the theme's entries per layer, keeping entry order.
            let mut order: Vec<String> = Vec::new();
            let mut styles: HashMap<String, Vec<String>> = HashMap::new();
            for entry in &theme.entries {
                if !styles.contains_key(&entry.layer) {
                    order.push(entry.layer.clone());
                }
                styles.entry(entry.layer.clone()).or_default().push(entry.style.clone());
            }
            ThemeNode {
                name: theme.name.clone(),
                layers: order
                    .into_iter()
                    .map(|id| ThemeLayerNode {
                        name: layer_name(graph, &id),
                        styles: styles.remove(&id).unwrap_or_default(),
                        id,
                    })
                    .collect(),
            }
        })
        .collect();

    let relations = graph
        .relations
        .iter()
        .map(|rel| RelationNode {
            name: rel.name.clone(),
            parent: RelationEnd {
                id: rel.parent_layer.clone(),
                name: layer_name(graph, &rel.parent_layer),
                fields: rel.fields.iter().map(|f| f.referenced_field.clone()).collect(),
            },
            child: RelationEnd {
                id: rel.child_layer.clone(),
                name: layer_name(graph, &rel.child_layer),
                fields: rel.fields.iter().map(|f| f.referencing_field.clone()).collect(),
            },
        })
        .collect();

    ProjectSummary { counts, meta: graph.meta.clone(), layer_tree, themes, relations }
}

fn tree_node(graph: &EntityGraph, entry: &TreeEntry) -> TreeNode {
    match entry {
        TreeEntry::Group(id) => {
            let (name, children) = match graph.group(id) {
                Some(g) => {
                    (g.name.clone(), g.children.iter().map(|c| tree_node(graph, c)).collect())
                }
                None => (id.clone(), Vec::new()),
            };
            TreeNode::Group { name, children }
        }
        TreeEntry::Layer(id) => TreeNode::Layer {
            id: id.clone(),
            name: layer_name(graph, id),
            styles: graph
                .layer(id)
                .map(|l| l.styles.iter().map(|s| s.name.clone()).collect())
                .unwrap_or_default(),
        },
    }
}

fn layer_name(graph: &EntityGraph, id: &str) -> String {
    graph.layer(id).map(|l| l.name.clone()).unwrap_or_else(|| id.to_string())
}

// Layer inventory exports for downstream tooling

pub fn export_inventory_json(graph: &EntityGraph, path: &Path) -> std::io::Result<()> {
    use std::fs::File;
    use std::io::Write;
    #[derive(serde::Serialize)]
    struct LayerRow<'a> {
        id: &'a str,
        name: &'a str,
        provider: Option<&'a str>,
        source: Option<&'a str>,
        crs: Option<&'a str>,
        styles: Vec<&'a str>,
    }
    let rows: Vec<LayerRow> = graph
        .layers
        .iter()
        .map(|l| LayerRow {
            id: &l.id,
            name: &l.name,
            provider: l.provider.as_deref(),
            source: l.source.as_deref(),
            crs: l.crs.as_deref(),
            styles: l.styles.iter().map(|s| s.name.as_str()).collect(),
        })
        .collect();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let f = File::create(path)?;
    serde_json::to_writer_pretty(f, &rows)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    // ensure newline at end
    let mut f2 = std::fs::OpenOptions::new().append(true).open(path)?;
    let _ = f2.write_all(b"\n");
    Ok(())
}

pub fn export_inventory_csv(graph: &EntityGraph, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    // headers: id,name,provider,source,crs,styles_json
    wtr.write_record(["id", "name", "provider", "source", "crs", "styles_json"])?;
    for l in &graph.layers {
        let styles: Vec<&str> = l.styles.iter().map(|s| s.name.as_str()).collect();
        let styles_json = serde_json::to_string(&styles).unwrap_or_else(|_| "[]".into());
        wtr.write_record(&[
            l.id.clone(),
            l.name.clone(),
            l.provider.clone().unwrap_or_default(),
            l.source.clone().unwrap_or_default(),
            l.crs.clone().unwrap_or_default(),
            styles_json,
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
