use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command};

use project_sieve::filter::engine::{self, FilterOptions};
use project_sieve::filter::serializer;
use project_sieve::persistence::persist;
use project_sieve::persistence::settings::AppSettings;
use project_sieve::project::graph::{EntityGraph, EntityKind};
use project_sieve::project::loader;
use project_sieve::report::summary;
use project_sieve::selection::resolve;
use project_sieve::selection::state::SelectionState;

fn main() -> Result<()> {
    env_logger::init();
    let matches = Command::new("project-sieve")
        .about("Project-Sieve — prune a structured map project down to a selected subset")
        .arg(
            Arg::new("project")
                .required(true)
                .value_name("FILE")
                .help("Project file, plain markup (.qgs) or archive (.qgz)"),
        )
        .arg(
            Arg::new("select")
                .short('s')
                .long("select")
                .value_name("KIND:ID")
                .action(ArgAction::Append)
                .help("Mark an entity selected; kinds: layer, group, style, theme, layout, relation (style ids are layer_id|style_name)"),
        )
        .arg(
            Arg::new("deselect")
                .short('d')
                .long("deselect")
                .value_name("KIND:ID")
                .action(ArgAction::Append)
                .help("Mark an entity deselected"),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .action(ArgAction::SetTrue)
                .help("Select every entity before applying other marks"),
        )
        .arg(
            Arg::new("session")
                .long("session")
                .value_name("FILE")
                .help("Replay a saved selection session before other marks"),
        )
        .arg(
            Arg::new("save_session")
                .long("save-session")
                .action(ArgAction::SetTrue)
                .help("Save this selection pass as a timestamped session file"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the filtered project archive here"),
        )
        .arg(
            Arg::new("markup")
                .long("emit-markup")
                .value_name("FILE")
                .help("Also write the filtered markup as a plain file"),
        )
        .arg(
            Arg::new("disconnect")
                .long("disconnect-sources")
                .action(ArgAction::SetTrue)
                .help("Rewrite every retained layer's source locator to the disconnected placeholder"),
        )
        .arg(
            Arg::new("summary")
                .long("summary")
                .action(ArgAction::SetTrue)
                .help("Print a JSON summary (of the filtered project when exporting)"),
        )
        .arg(Arg::new("inventory_csv").long("inventory-csv").value_name("FILE").help("Write the layer inventory as CSV"))
        .arg(Arg::new("inventory_json").long("inventory-json").value_name("FILE").help("Write the layer inventory as JSON"))
        .get_matches();

    let settings = AppSettings::load().unwrap_or_default();
    persist::set_settings_override(settings.clone());

    let path = PathBuf::from(matches.get_one::<String>("project").unwrap());
    let loaded =
        loader::open_project(&path).with_context(|| format!("loading {}", path.display()))?;
    for d in &loaded.diagnostics {
        eprintln!("warning: {}", d);
    }
    let graph = loaded.graph;

    let mut session_disconnect = false;
    let mut selection = SelectionState::new();
    if let Some(p) = matches.get_one::<String>("session") {
        let session = persist::load_from_path(Path::new(p))
            .with_context(|| format!("loading session {}", p))?;
        session_disconnect = session.disconnect_sources;
        selection = session.apply(&graph);
    }
    if matches.get_flag("all") {
        selection.select_all(&graph);
    }
    for raw in matches.get_many::<String>("select").unwrap_or_default() {
        let (kind, id) = parse_mark(raw)?;
        selection.set(&graph, kind, &id, true);
    }
    for raw in matches.get_many::<String>("deselect").unwrap_or_default() {
        let (kind, id) = parse_mark(raw)?;
        selection.set(&graph, kind, &id, false);
    }

    resolve::auto_select_relations(&graph, &mut selection);

    let disconnect =
        matches.get_flag("disconnect") || session_disconnect || settings.disconnect_sources;
    let exporting = matches.contains_id("output") || matches.contains_id("markup");

    if exporting {
        // Advisory only; an empty selection still exports a valid project.
        if selection.selected_ids(&graph, EntityKind::Layer).is_empty() {
            eprintln!("warning: no layer is selected; the exported project will be empty");
        }
        let pruned = engine::filter_graph(
            &graph,
            &selection,
            FilterOptions { disconnect_sources: disconnect },
        );
        if let Some(p) = matches.get_one::<String>("output") {
            serializer::save_filtered_project(Path::new(p), &pruned)
                .with_context(|| format!("writing {}", p))?;
            println!("filtered project written to {}", p);
        }
        if let Some(p) = matches.get_one::<String>("markup") {
            serializer::save_markup(Path::new(p), &pruned)
                .with_context(|| format!("writing {}", p))?;
        }
        report_outputs(&matches, &pruned)?;
    } else {
        report_outputs(&matches, &graph)?;
    }

    if matches.get_flag("save_session") {
        let session = persist::SessionFile::from_runtime(&selection, disconnect);
        let saved = persist::save_versioned(&session)?;
        println!("session saved to {}", saved.display());
    }
    Ok(())
}

fn report_outputs(matches: &ArgMatches, graph: &EntityGraph) -> Result<()> {
    if matches.get_flag("summary") {
        let snapshot = summary::summarize(graph);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    if let Some(p) = matches.get_one::<String>("inventory_csv") {
        summary::export_inventory_csv(graph, Path::new(p))?;
    }
    if let Some(p) = matches.get_one::<String>("inventory_json") {
        summary::export_inventory_json(graph, Path::new(p))?;
    }
    Ok(())
}

fn parse_mark(raw: &str) -> Result<(EntityKind, String)> {
    let (kind, id) =
        raw.split_once(':').ok_or_else(|| anyhow!("expected KIND:ID, got '{}'", raw))?;
    let kind: EntityKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    if id.is_empty() {
        return Err(anyhow!("empty identifier in '{}'", raw));
    }
    Ok((kind, id.to_string()))
}
