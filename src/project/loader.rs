use std::collections::HashSet;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;

use log::warn;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

use super::graph::{
    AuxResource, EntityGraph, Extent, FieldRef, Group, Layer, LayerId, Layout, Relation, Style,
    Theme, ThemeEntry, TreeEntry,
};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read project file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid project archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive contains no project markup entry")]
    MissingProjectEntry,
    #[error("malformed markup in <{element}> at byte {position}: {message}")]
    Markup {
        element: String,
        position: usize,
        message: String,
    },
}

/// Non-fatal anomalies found while resolving cross-references. The affected
/// entities stay in the graph, inert, exactly as the document had them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    UnresolvedThemeLayer { theme: String, layer: LayerId },
    UnresolvedRelationEndpoint { relation: String, layer: LayerId },
    DuplicateLayerId { layer: LayerId },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnresolvedThemeLayer { theme, layer } => {
                write!(f, "theme '{}' references missing layer '{}'", theme, layer)
            }
            Diagnostic::UnresolvedRelationEndpoint { relation, layer } => {
                write!(f, "relation '{}' references missing layer '{}'", relation, layer)
            }
            Diagnostic::DuplicateLayerId { layer } => {
                write!(f, "duplicate layer id '{}' (first definition kept)", layer)
            }
        }
    }
}

#[derive(Debug)]
pub struct LoadedProject {
    pub graph: EntityGraph,
    pub diagnostics: Vec<Diagnostic>,
}

/// Open a project from disk, accepting both container variants: plain markup
/// and the zip archive bundling markup plus auxiliary resources.
pub fn open_project(path: &Path) -> Result<LoadedProject, LoadError> {
    let bytes = std::fs::read(path)?;
    if bytes.starts_with(b"PK") {
        let mut archive = zip::ZipArchive::new(Cursor::new(&bytes))?;
        let mut markup: Option<Vec<u8>> = None;
        let mut aux = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            if name.ends_with(".qgs") && markup.is_none() {
                markup = Some(buf);
            } else {
                aux.push(AuxResource { name, bytes: buf });
            }
        }
        let markup = markup.ok_or(LoadError::MissingProjectEntry)?;
        let mut loaded = load_project_bytes(&markup)?;
        loaded.graph.aux_resources = aux;
        Ok(loaded)
    } else {
        load_project_bytes(&bytes)
    }
}

/// Parse markup bytes into an entity graph. Pure: the input is not touched,
/// and a failure leaves no partial graph observable.
pub fn load_project_bytes(xml: &[u8]) -> Result<LoadedProject, LoadError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut graph = EntityGraph::new();
    let mut diagnostics = Vec::new();
    let mut seen_layer_ids: HashSet<LayerId> = HashSet::new();
    let mut seen_layouts: HashSet<String> = HashSet::new();
    let mut seen_root_attrs = false;
    let mut seen_tree = false;

    let mut buf = Vec::new();
    loop {
        let tag_start = reader.buffer_position() as usize;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(&reader, "document", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"qgis" if !seen_root_attrs => {
                    seen_root_attrs = true;
                    graph.meta.version = attr(&reader, &e, "version")?;
                    graph.meta.save_user = attr(&reader, &e, "saveUserFull")?;
                    graph.meta.save_date = attr(&reader, &e, "saveDateTime")?;
                }
                b"projectCrs" => parse_project_crs(&mut reader, &mut graph)?,
                b"mapcanvas" => parse_mapcanvas(&mut reader, &mut graph)?,
                b"layer-tree-group" if !seen_tree => {
                    seen_tree = true;
                    parse_layer_tree(&mut reader, &mut graph)?;
                }
                b"maplayer" => {
                    let layer = parse_maplayer(&mut reader, xml, &e)?;
                    if seen_layer_ids.insert(layer.id.clone()) {
                        graph.add_layer(layer);
                    } else {
                        diagnostics.push(Diagnostic::DuplicateLayerId { layer: layer.id });
                    }
                }
                b"visibility-presets" => parse_visibility_presets(&mut reader, &mut graph)?,
                b"relations" => parse_relations(&mut reader, &mut graph)?,
                // Layouts appear in varying containers and casing; detect the
                // element itself anywhere, first appearance wins.
                b"Layout" | b"layout" => {
                    let name = attr(&reader, &e, "name")?.unwrap_or_default();
                    skip_subtree(&mut reader, &e)?;
                    let payload = raw_slice(xml, tag_start, reader.buffer_position() as usize);
                    if !name.is_empty() && seen_layouts.insert(name.clone()) {
                        graph.layouts.push(Layout { name, payload });
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if matches!(e.local_name().as_ref(), b"Layout" | b"layout") {
                    let name = attr(&reader, &e, "name")?.unwrap_or_default();
                    let payload = raw_slice(xml, tag_start, reader.buffer_position() as usize);
                    if !name.is_empty() && seen_layouts.insert(name.clone()) {
                        graph.layouts.push(Layout { name, payload });
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // Cross-references are resolved once, here; unresolved ones are recorded
    // and kept, never invented and never dropped.
    for theme in &graph.themes {
        for entry in &theme.entries {
            if graph.layer(&entry.layer).is_none() {
                diagnostics.push(Diagnostic::UnresolvedThemeLayer {
                    theme: theme.name.clone(),
                    layer: entry.layer.clone(),
                });
            }
        }
    }
    for rel in &graph.relations {
        for endpoint in [&rel.parent_layer, &rel.child_layer] {
            if graph.layer(endpoint).is_none() {
                diagnostics.push(Diagnostic::UnresolvedRelationEndpoint {
                    relation: rel.name.clone(),
                    layer: endpoint.clone(),
                });
            }
        }
    }
    for d in &diagnostics {
        warn!("{}", d);
    }

    // Record each layer's containing group now that both sides exist.
    let memberships: Vec<(LayerId, String)> = graph
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
        if let Some(layer) = graph.layer_mut(&lid) {
            layer.parent_group = Some(gid);
        }
    }

    graph.source_xml = xml.to_vec();
    Ok(LoadedProject { graph, diagnostics })
}

fn markup_err(reader: &Reader<&[u8]>, element: &str, message: String) -> LoadError {
    LoadError::Markup {
        element: element.to_string(),
        position: reader.buffer_position() as usize,
        message,
    }
}

fn attr(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
    name: &str,
) -> Result<Option<String>, LoadError> {
    let element = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    match e.try_get_attribute(name) {
        Ok(Some(a)) => match a.unescape_value() {
            Ok(v) => Ok(Some(v.into_owned())),
            Err(err) => Err(markup_err(reader, &element, err.to_string())),
        },
        Ok(None) => Ok(None),
        Err(err) => Err(markup_err(reader, &element, err.to_string())),
    }
}

fn skip_subtree(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>) -> Result<(), LoadError> {
    let element = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let end = e.to_end().into_owned();
    let mut skip = Vec::new();
    reader
        .read_to_end_into(end.name(), &mut skip)
        .map(|_| ())
        .map_err(|err| markup_err(reader, &element, err.to_string()))
}

fn raw_slice(xml: &[u8], start: usize, end: usize) -> String {
    String::from_utf8_lossy(&xml[start..end]).into_owned()
}

/// Collect the text content of the element we just entered.
fn element_text(reader: &mut Reader<&[u8]>, element: &[u8]) -> Result<String, LoadError> {
    let name = String::from_utf8_lossy(element).into_owned();
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(t)) => match t.unescape() {
                Ok(s) => out.push_str(&s),
                Err(err) => return Err(markup_err(reader, &name, err.to_string())),
            },
            Ok(Event::CData(c)) => out.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => {
                return Err(markup_err(reader, &name, "unexpected end of document".into()));
            }
            Ok(_) => {}
            Err(err) => return Err(markup_err(reader, &name, err.to_string())),
        }
        buf.clear();
    }
    Ok(out)
}

fn parse_project_crs(reader: &mut Reader<&[u8]>, graph: &mut EntityGraph) -> Result<(), LoadError> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"authid" => {
                    let text = element_text(reader, b"authid")?;
                    graph.meta.crs_authid.get_or_insert(text);
                }
                b"description" => {
                    let text = element_text(reader, b"description")?;
                    graph.meta.crs_description.get_or_insert(text);
                }
                _ => depth += 1,
            },
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => {
                return Err(markup_err(reader, "projectCrs", "unexpected end of document".into()));
            }
            Ok(_) => {}
            Err(err) => return Err(markup_err(reader, "projectCrs", err.to_string())),
        }
        buf.clear();
    }
    Ok(())
}

fn parse_mapcanvas(reader: &mut Reader<&[u8]>, graph: &mut EntityGraph) -> Result<(), LoadError> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let (mut xmin, mut ymin, mut xmax, mut ymax) = (None, None, None, None);
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"extent" => depth += 1,
                b"xmin" => xmin = element_text(reader, b"xmin")?.trim().parse::<f64>().ok(),
                b"ymin" => ymin = element_text(reader, b"ymin")?.trim().parse::<f64>().ok(),
                b"xmax" => xmax = element_text(reader, b"xmax")?.trim().parse::<f64>().ok(),
                b"ymax" => ymax = element_text(reader, b"ymax")?.trim().parse::<f64>().ok(),
                _ => depth += 1,
            },
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => {
                return Err(markup_err(reader, "mapcanvas", "unexpected end of document".into()));
            }
            Ok(_) => {}
            Err(err) => return Err(markup_err(reader, "mapcanvas", err.to_string())),
        }
        buf.clear();
    }
    if graph.meta.extent.is_none()
        && let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) = (xmin, ymin, xmax, ymax)
    {
        graph.meta.extent = Some(Extent { xmin, ymin, xmax, ymax });
    }
    Ok(())
}

/// Walk the nested group tree. Group identifiers are the slash-joined path of
/// group names from the root, made unique with a numeric suffix on collision.
fn parse_layer_tree(reader: &mut Reader<&[u8]>, graph: &mut EntityGraph) -> Result<(), LoadError> {
    struct Frame {
        id: String,
        name: String,
        children: Vec<TreeEntry>,
    }
    let mut buf = Vec::new();
    let mut roots: Vec<TreeEntry> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "layer-tree-group", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"layer-tree-group" => {
                    let name = attr(reader, &e, "name")?.unwrap_or_default();
                    let id = super::graph::unique_group_id(
                        &mut taken,
                        stack.last().map(|f| f.id.as_str()),
                        &name,
                    );
                    stack.push(Frame { id, name, children: Vec::new() });
                }
                b"layer-tree-layer" => {
                    if let Some(id) = attr(reader, &e, "id")? {
                        let entry = TreeEntry::Layer(id);
                        match stack.last_mut() {
                            Some(frame) => frame.children.push(entry),
                            None => roots.push(entry),
                        }
                    }
                    skip_subtree(reader, &e)?;
                }
                _ => skip_subtree(reader, &e)?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"layer-tree-layer" => {
                    if let Some(id) = attr(reader, &e, "id")? {
                        let entry = TreeEntry::Layer(id);
                        match stack.last_mut() {
                            Some(frame) => frame.children.push(entry),
                            None => roots.push(entry),
                        }
                    }
                }
                // Self-closing group: childless, but still addressable.
                b"layer-tree-group" => {
                    let name = attr(reader, &e, "name")?.unwrap_or_default();
                    let id = super::graph::unique_group_id(
                        &mut taken,
                        stack.last().map(|f| f.id.as_str()),
                        &name,
                    );
                    let entry = TreeEntry::Group(id.clone());
                    match stack.last_mut() {
                        Some(frame) => frame.children.push(entry),
                        None => roots.push(entry),
                    }
                    graph.add_group(Group { id, name, children: Vec::new() });
                }
                _ => {}
            },
            Event::End(_) => match stack.pop() {
                Some(frame) => {
                    let entry = TreeEntry::Group(frame.id.clone());
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(entry),
                        None => roots.push(entry),
                    }
                    graph.add_group(Group {
                        id: frame.id,
                        name: frame.name,
                        children: frame.children,
                    });
                }
                // End of the root container itself.
                None => break,
            },
            Event::Eof => {
                return Err(markup_err(
                    reader,
                    "layer-tree-group",
                    "unexpected end of document".into(),
                ));
            }
            _ => {}
        }
        buf.clear();
    }
    graph.roots = roots;
    Ok(())
}

fn parse_maplayer(
    reader: &mut Reader<&[u8]>,
    xml: &[u8],
    start: &BytesStart<'_>,
) -> Result<Layer, LoadError> {
    let mut id = String::new();
    let mut name = String::new();
    let mut source: Option<String> = None;
    // Some schema variants carry the provider as an attribute, others as a
    // child element; the attribute wins when both are present.
    let mut provider = attr(reader, start, "provider")?;
    let mut crs: Option<String> = None;
    let mut styles: Vec<Style> = Vec::new();
    let mut seen_styles: HashSet<String> = HashSet::new();
    let mut current: Option<String> = None;

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "maplayer", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"id" => id = element_text(reader, b"id")?,
                b"layername" => name = element_text(reader, b"layername")?,
                b"datasource" => source = Some(element_text(reader, b"datasource")?),
                b"provider" => {
                    let text = element_text(reader, b"provider")?;
                    if provider.is_none() {
                        provider = Some(text);
                    }
                }
                b"srs" | b"spatialrefsys" => {
                    if crs.is_none() {
                        crs = parse_layer_crs(reader)?;
                    } else {
                        skip_subtree(reader, &e)?;
                    }
                }
                b"map-layer-style-manager" | b"style-manager" => {
                    if current.is_none() {
                        current = attr(reader, &e, "current")?;
                    }
                    parse_style_manager(reader, xml, &e, &mut styles, &mut seen_styles)?;
                }
                _ => skip_subtree(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => {
                return Err(markup_err(reader, "maplayer", "unexpected end of document".into()));
            }
            _ => {}
        }
        buf.clear();
    }

    if id.is_empty() {
        return Err(markup_err(reader, "maplayer", "missing layer id".into()));
    }
    if name.is_empty() {
        name = id.clone();
    }
    // The manager's current style may not appear as a child; add it. A layer
    // with no style information at all still offers 'default'.
    if let Some(cur) = &current
        && !cur.is_empty()
        && seen_styles.insert(cur.clone())
    {
        styles.push(Style { name: cur.clone(), payload: String::new() });
    }
    if styles.is_empty() {
        styles.push(Style { name: "default".into(), payload: String::new() });
    }
    let current_style = current
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| styles[0].name.clone());

    Ok(Layer {
        id,
        name,
        provider,
        source,
        crs,
        current_style,
        styles,
        parent_group: None,
    })
}

/// CRS of a single layer: authid when present, bare EPSG code as fallback.
fn parse_layer_crs(reader: &mut Reader<&[u8]>) -> Result<Option<String>, LoadError> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut authid: Option<String> = None;
    let mut epsg: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"authid" => authid = Some(element_text(reader, b"authid")?),
                b"epsg" => epsg = Some(element_text(reader, b"epsg")?),
                _ => depth += 1,
            },
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => {
                return Err(markup_err(reader, "spatialrefsys", "unexpected end of document".into()));
            }
            Ok(_) => {}
            Err(err) => return Err(markup_err(reader, "spatialrefsys", err.to_string())),
        }
        buf.clear();
    }
    Ok(authid
        .filter(|a| !a.is_empty())
        .or_else(|| epsg.filter(|e| !e.is_empty()).map(|e| format!("EPSG:{}", e))))
}

fn parse_style_manager(
    reader: &mut Reader<&[u8]>,
    xml: &[u8],
    mgr: &BytesStart<'_>,
    styles: &mut Vec<Style>,
    seen: &mut HashSet<String>,
) -> Result<(), LoadError> {
    let mgr_name = mgr.local_name().as_ref().to_vec();
    let mut buf = Vec::new();
    loop {
        let tag_start = reader.buffer_position() as usize;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "style-manager", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"map-layer-style" | b"style" => {
                    let name = attr(reader, &e, "name")?
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| "default".into());
                    skip_subtree(reader, &e)?;
                    let payload = raw_slice(xml, tag_start, reader.buffer_position() as usize);
                    if seen.insert(name.clone()) {
                        styles.push(Style { name, payload });
                    }
                }
                _ => skip_subtree(reader, &e)?,
            },
            Event::Empty(e) => {
                if matches!(e.local_name().as_ref(), b"map-layer-style" | b"style") {
                    let name = attr(reader, &e, "name")?
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| "default".into());
                    let payload = raw_slice(xml, tag_start, reader.buffer_position() as usize);
                    if seen.insert(name.clone()) {
                        styles.push(Style { name, payload });
                    }
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == mgr_name.as_slice() {
                    break;
                }
            }
            Event::Eof => {
                return Err(markup_err(reader, "style-manager", "unexpected end of document".into()));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_visibility_presets(
    reader: &mut Reader<&[u8]>,
    graph: &mut EntityGraph,
) -> Result<(), LoadError> {
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "visibility-presets", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"visibility-preset" => {
                    let name = attr(reader, &e, "name")?.unwrap_or_default();
                    let entries = parse_preset_entries(reader)?;
                    if !name.is_empty() {
                        graph.themes.push(Theme { name, entries });
                    }
                }
                _ => skip_subtree(reader, &e)?,
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"visibility-preset"
                    && let Some(name) = attr(reader, &e, "name")?
                    && !name.is_empty()
                {
                    graph.themes.push(Theme { name, entries: Vec::new() });
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"visibility-presets" {
                    break;
                }
            }
            Event::Eof => {
                return Err(markup_err(
                    reader,
                    "visibility-presets",
                    "unexpected end of document".into(),
                ));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_preset_entries(reader: &mut Reader<&[u8]>) -> Result<Vec<ThemeEntry>, LoadError> {
    let mut buf = Vec::new();
    let mut entries: Vec<ThemeEntry> = Vec::new();
    let mut push = |entries: &mut Vec<ThemeEntry>, layer: Option<String>, style: Option<String>| {
        if let Some(layer) = layer
            && !layer.is_empty()
        {
            // A missing style attribute means the preset default.
            let entry = ThemeEntry { layer, style: style.unwrap_or_default() };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
    };
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "visibility-preset", e.to_string()))?;
        match event {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"layer" {
                    let layer = attr(reader, &e, "id")?;
                    let style = attr(reader, &e, "style")?;
                    skip_subtree(reader, &e)?;
                    push(&mut entries, layer, style);
                } else {
                    skip_subtree(reader, &e)?;
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"layer" {
                    let layer = attr(reader, &e, "id")?;
                    let style = attr(reader, &e, "style")?;
                    push(&mut entries, layer, style);
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"visibility-preset" {
                    break;
                }
            }
            Event::Eof => {
                return Err(markup_err(
                    reader,
                    "visibility-preset",
                    "unexpected end of document".into(),
                ));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

fn parse_relations(reader: &mut Reader<&[u8]>, graph: &mut EntityGraph) -> Result<(), LoadError> {
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "relations", e.to_string()))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"relation" => {
                    let name = attr(reader, &e, "name")?.unwrap_or_default();
                    let parent_layer = attr(reader, &e, "referencedLayer")?.unwrap_or_default();
                    let child_layer = attr(reader, &e, "referencingLayer")?.unwrap_or_default();
                    let fields = parse_relation_fields(reader)?;
                    if !name.is_empty() {
                        graph.relations.push(Relation { name, parent_layer, child_layer, fields });
                    }
                }
                _ => skip_subtree(reader, &e)?,
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"relation"
                    && let Some(name) = attr(reader, &e, "name")?
                    && !name.is_empty()
                {
                    let parent_layer = attr(reader, &e, "referencedLayer")?.unwrap_or_default();
                    let child_layer = attr(reader, &e, "referencingLayer")?.unwrap_or_default();
                    graph.relations.push(Relation {
                        name,
                        parent_layer,
                        child_layer,
                        fields: Vec::new(),
                    });
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"relations" {
                    break;
                }
            }
            Event::Eof => {
                return Err(markup_err(reader, "relations", "unexpected end of document".into()));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_relation_fields(reader: &mut Reader<&[u8]>) -> Result<Vec<FieldRef>, LoadError> {
    let mut buf = Vec::new();
    let mut fields = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| markup_err(reader, "relation", e.to_string()))?;
        match event {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"fieldRef" => {
                let referenced_field = attr(reader, &e, "referencedField")?.unwrap_or_default();
                let referencing_field = attr(reader, &e, "referencingField")?.unwrap_or_default();
                fields.push(FieldRef { referenced_field, referencing_field });
            }
            Event::Start(e) => skip_subtree(reader, &e)?,
            Event::End(e) => {
                if e.local_name().as_ref() == b"relation" {
                    break;
                }
            }
            Event::Eof => {
                return Err(markup_err(reader, "relation", "unexpected end of document".into()));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(fields)
}
