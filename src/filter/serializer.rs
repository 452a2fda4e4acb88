use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;

use log::info;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::project::graph::{self, EntityGraph, Layer, ThemeEntry};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid archive output: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("markup rewrite failed: {0}")]
    Markup(String),
}

/// Lookup tables over a pruned graph, borrowed for one serialization pass.
struct Retained<'a> {
    layers: HashMap<&'a str, &'a Layer>,
    groups: HashSet<&'a str>,
    themes: HashMap<&'a str, &'a [ThemeEntry]>,
    layouts: HashSet<&'a str>,
    relations: HashSet<&'a str>,
}

impl<'a> Retained<'a> {
    fn new(pruned: &'a EntityGraph) -> Self {
        Self {
            layers: pruned.layers.iter().map(|l| (l.id.as_str(), l)).collect(),
            groups: pruned.groups.iter().map(|g| g.id.as_str()).collect(),
            themes: pruned.themes.iter().map(|t| (t.name.as_str(), t.entries.as_slice())).collect(),
            layouts: pruned.layouts.iter().map(|l| l.name.as_str()).collect(),
            relations: pruned.relations.iter().map(|r| r.name.as_str()).collect(),
        }
    }
}

/// Re-emit a pruned graph as project markup. The output is the original byte
/// stream minus pruned subtrees, with locator rewrites where the graph's
/// value no longer matches the document, so untouched regions stay as the
/// author saved them.
pub fn write_project_markup(pruned: &EntityGraph) -> Result<Vec<u8>, ExportError> {
    let ret = Retained::new(pruned);
    let mut reader = Reader::from_reader(&pruned.source_xml[..]);
    let mut writer = Writer::new(Vec::new());

    let mut in_tree = false;
    let mut group_stack: Vec<String> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut in_presets = false;
    let mut current_preset: Option<String> = None;
    let mut in_relations = false;

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ExportError::Markup(e.to_string()))?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"maplayer" => {
                    let events = buffer_subtree(&mut reader, e)?;
                    let id = buffered_layer_id(&events).unwrap_or_default();
                    if let Some(layer) = ret.layers.get(id.as_str()) {
                        replay_maplayer(&mut writer, &events, layer)?;
                    }
                }
                b"layer-tree-group" => {
                    if !in_tree {
                        in_tree = true;
                        emit(&mut writer, Event::Start(e.clone()))?;
                    } else {
                        let name = attr_string(e, "name")?;
                        let id = graph::unique_group_id(
                            &mut taken,
                            group_stack.last().map(|s| s.as_str()),
                            &name,
                        );
                        if ret.groups.contains(id.as_str()) {
                            group_stack.push(id);
                            emit(&mut writer, Event::Start(e.clone()))?;
                        } else {
                            skip_current(&mut reader, e)?;
                        }
                    }
                }
                b"layer-tree-layer" => {
                    let id = attr_string(e, "id")?;
                    if ret.layers.contains_key(id.as_str()) {
                        copy_subtree(&mut reader, &mut writer, e)?;
                    } else {
                        skip_current(&mut reader, e)?;
                    }
                }
                b"visibility-presets" => {
                    if ret.themes.is_empty() {
                        skip_current(&mut reader, e)?;
                    } else {
                        in_presets = true;
                        emit(&mut writer, Event::Start(e.clone()))?;
                    }
                }
                b"visibility-preset" if in_presets => {
                    let name = attr_string(e, "name")?;
                    if ret.themes.contains_key(name.as_str()) {
                        current_preset = Some(name);
                        emit(&mut writer, Event::Start(e.clone()))?;
                    } else {
                        skip_current(&mut reader, e)?;
                    }
                }
                b"layer" if current_preset.is_some() => {
                    if preset_entry_kept(&ret, current_preset.as_deref().unwrap_or(""), e)? {
                        copy_subtree(&mut reader, &mut writer, e)?;
                    } else {
                        skip_current(&mut reader, e)?;
                    }
                }
                b"relations" => {
                    if ret.relations.is_empty() {
                        skip_current(&mut reader, e)?;
                    } else {
                        in_relations = true;
                        emit(&mut writer, Event::Start(e.clone()))?;
                    }
                }
                b"relation" if in_relations => {
                    let name = attr_string(e, "name")?;
                    if ret.relations.contains(name.as_str()) {
                        copy_subtree(&mut reader, &mut writer, e)?;
                    } else {
                        skip_current(&mut reader, e)?;
                    }
                }
                b"Layout" | b"layout" => {
                    let name = attr_string(e, "name")?;
                    if ret.layouts.contains(name.as_str()) {
                        copy_subtree(&mut reader, &mut writer, e)?;
                    } else {
                        skip_current(&mut reader, e)?;
                    }
                }
                _ => emit(&mut writer, Event::Start(e.clone()))?,
            },
            Event::Empty(ref e) => {
                let keep = match e.local_name().as_ref() {
                    b"layer-tree-layer" if in_tree => {
                        ret.layers.contains_key(attr_string(e, "id")?.as_str())
                    }
                    b"layer-tree-group" if in_tree => {
                        let name = attr_string(e, "name")?;
                        let id = graph::unique_group_id(
                            &mut taken,
                            group_stack.last().map(|s| s.as_str()),
                            &name,
                        );
                        ret.groups.contains(id.as_str())
                    }
                    b"layer" if current_preset.is_some() => {
                        preset_entry_kept(&ret, current_preset.as_deref().unwrap_or(""), e)?
                    }
                    b"visibility-preset" if in_presets => {
                        ret.themes.contains_key(attr_string(e, "name")?.as_str())
                    }
                    b"relation" if in_relations => {
                        ret.relations.contains(attr_string(e, "name")?.as_str())
                    }
                    b"Layout" | b"layout" => {
                        ret.layouts.contains(attr_string(e, "name")?.as_str())
                    }
                    _ => true,
                };
                if keep {
                    emit(&mut writer, Event::Empty(e.clone()))?;
                }
            }
            Event::End(ref e) => {
                match e.local_name().as_ref() {
                    b"layer-tree-group" => {
                        if group_stack.pop().is_none() {
                            in_tree = false;
                        }
                    }
                    b"visibility-presets" => in_presets = false,
                    b"visibility-preset" => current_preset = None,
                    b"relations" => in_relations = false,
                    _ => {}
                }
                emit(&mut writer, Event::End(e.clone()))?;
            }
            other => emit(&mut writer, other)?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

/// Write the pruned project as a plain markup file.
pub fn save_markup(path: &Path, pruned: &EntityGraph) -> Result<(), ExportError> {
    let markup = write_project_markup(pruned)?;
    std::fs::write(path, &markup)?;
    info!("wrote filtered markup to {}", path.display());
    Ok(())
}

/// Write the pruned project as the archive container: the markup under
/// `project.qgs` plus every auxiliary resource the output still references.
pub fn save_filtered_project(path: &Path, pruned: &EntityGraph) -> Result<(), ExportError> {
    let markup = write_project_markup(pruned)?;
    let file = std::fs::File::create(path)?;
    let mut archive = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    archive.start_file("project.qgs", options.clone())?;
    archive.write_all(&markup)?;
    for aux in &pruned.aux_resources {
        if aux_still_referenced(&markup, &aux.name) {
            archive.start_file(aux.name.as_str(), options.clone())?;
            archive.write_all(&aux.bytes)?;
        }
    }
    archive.finish()?;
    info!("wrote filtered project to {}", path.display());
    Ok(())
}

fn aux_still_referenced(markup: &[u8], name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    !base.is_empty() && markup.windows(base.len()).any(|w| w == base.as_bytes())
}

fn emit<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), ExportError> {
    writer.write_event(event).map_err(|e| ExportError::Markup(e.to_string()))
}

fn attr_string(e: &BytesStart<'_>, name: &str) -> Result<String, ExportError> {
    match e.try_get_attribute(name) {
        Ok(Some(a)) => a
            .unescape_value()
            .map(|v| v.into_owned())
            .map_err(|err| ExportError::Markup(err.to_string())),
        Ok(None) => Ok(String::new()),
        Err(err) => Err(ExportError::Markup(err.to_string())),
    }
}

fn preset_entry_kept(
    ret: &Retained<'_>,
    preset: &str,
    e: &BytesStart<'_>,
) -> Result<bool, ExportError> {
    let layer = attr_string(e, "id")?;
    let style = attr_string(e, "style")?;
    Ok(ret
        .themes
        .get(preset)
        .is_some_and(|entries| entries.iter().any(|en| en.layer == layer && en.style == style)))
}

/// Consume the element we just entered without writing anything.
fn skip_current(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>) -> Result<(), ExportError> {
    let end = e.to_end().into_owned();
    let mut skip = Vec::new();
    reader
        .read_to_end_into(end.name(), &mut skip)
        .map(|_| ())
        .map_err(|err| ExportError::Markup(err.to_string()))
}

/// Stream-copy the element we just entered, verbatim.
fn copy_subtree<W: Write>(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<W>,
    e: &BytesStart<'_>,
) -> Result<(), ExportError> {
    emit(writer, Event::Start(e.clone()))?;
    let mut depth = 1usize;
    let mut buf = Vec::new();
    while depth > 0 {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| ExportError::Markup(err.to_string()))?;
        match &event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(ExportError::Markup("unexpected end of document".into())),
            _ => {}
        }
        emit(writer, event)?;
        buf.clear();
    }
    Ok(())
}

/// Collect the element we just entered as owned events, start tag included.
fn buffer_subtree(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<Vec<Event<'static>>, ExportError> {
    let mut events = vec![Event::Start(start.clone()).into_owned()];
    let mut depth = 1usize;
    let mut buf = Vec::new();
    while depth > 0 {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| ExportError::Markup(err.to_string()))?;
        match &event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(ExportError::Markup("unexpected end of document".into())),
            _ => {}
        }
        events.push(event.into_owned());
        buf.clear();
    }
    Ok(events)
}

/// The id of a buffered layer definition: text of its direct `<id>` child.
fn buffered_layer_id(events: &[Event<'static>]) -> Option<String> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < events.len() {
        match &events[i] {
            Event::Start(e) => {
                depth += 1;
                if depth == 2 && e.local_name().as_ref() == b"id" {
                    return match events.get(i + 1) {
                        Some(Event::Text(t)) => t.unescape().ok().map(|s| s.trim().to_string()),
                        _ => None,
                    };
                }
            }
            Event::End(_) => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Replay a retained layer definition: non-retained style entries are
/// dropped, the locator is rewritten when the graph's value changed, and
/// everything else is copied as-is.
fn replay_maplayer<W: Write>(
    writer: &mut Writer<W>,
    events: &[Event<'static>],
    layer: &Layer,
) -> Result<(), ExportError> {
    let kept: HashSet<&str> = layer.styles.iter().map(|s| s.name.as_str()).collect();
    let target = layer.source.clone().unwrap_or_default();
    let mut in_manager = false;
    let mut i = 0;
    while i < events.len() {
        match &events[i] {
            Event::Start(e) if is_manager(e) => {
                in_manager = true;
                emit(writer, events[i].clone())?;
            }
            Event::End(e)
                if matches!(e.local_name().as_ref(), b"map-layer-style-manager" | b"style-manager") =>
            {
                in_manager = false;
                emit(writer, events[i].clone())?;
            }
            Event::Start(e) if in_manager && is_style_entry(e) => {
                if kept.contains(style_entry_name(e)?.as_str()) {
                    emit(writer, events[i].clone())?;
                } else {
                    i = end_of_buffered(events, i);
                }
            }
            Event::Empty(e) if in_manager && is_style_entry(e) => {
                if kept.contains(style_entry_name(e)?.as_str()) {
                    emit(writer, events[i].clone())?;
                }
            }
            Event::Start(e) if e.local_name().as_ref() == b"datasource" => {
                let (original, end_idx) = element_text_span(events, i);
                if original.trim() == target {
                    for event in &events[i..=end_idx] {
                        emit(writer, event.clone())?;
                    }
                } else {
                    emit(writer, events[i].clone())?;
                    emit(writer, Event::Text(BytesText::new(&target)))?;
                    emit(writer, events[end_idx].clone())?;
                }
                i = end_idx;
            }
            Event::Empty(e) if e.local_name().as_ref() == b"datasource" => {
                if target.is_empty() {
                    emit(writer, events[i].clone())?;
                } else {
                    emit(writer, Event::Start(e.clone()))?;
                    emit(writer, Event::Text(BytesText::new(&target)))?;
                    emit(writer, Event::End(e.to_end().into_owned()))?;
                }
            }
            event => emit(writer, event.clone())?,
        }
        i += 1;
    }
    Ok(())
}

fn is_manager(e: &BytesStart<'_>) -> bool {
    matches!(e.local_name().as_ref(), b"map-layer-style-manager" | b"style-manager")
}

fn is_style_entry(e: &BytesStart<'_>) -> bool {
    matches!(e.local_name().as_ref(), b"map-layer-style" | b"style")
}

fn style_entry_name(e: &BytesStart<'_>) -> Result<String, ExportError> {
    let name = attr_string(e, "name")?;
    Ok(if name.trim().is_empty() { "default".into() } else { name })
}

/// Index of the End event closing the element starting at `start`.
fn end_of_buffered(events: &[Event<'static>], start: usize) -> usize {
    let mut depth = 1usize;
    let mut j = start + 1;
    while j < events.len() {
        match &events[j] {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return j;
                }
            }
            _ => {}
        }
        j += 1;
    }
    events.len() - 1
}

/// Concatenated text of the element starting at `start`, plus the index of
/// its End event.
fn element_text_span(events: &[Event<'static>], start: usize) -> (String, usize) {
    let mut text = String::new();
    let mut depth = 1usize;
    let mut j = start + 1;
    while j < events.len() {
        match &events[j] {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Text(t) => {
                if let Ok(s) = t.unescape() {
                    text.push_str(&s);
                }
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(c)),
            _ => {}
        }
        j += 1;
    }
    (text, j)
}
