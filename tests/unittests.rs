use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};

use project_sieve::filter::engine::{DISCONNECTED_SOURCE, FilterOptions, filter_graph};
use project_sieve::filter::serializer::{save_filtered_project, write_project_markup};
use project_sieve::persistence::persist::SessionFile;
use project_sieve::project::graph::{EntityGraph, EntityKind, TreeEntry};
use project_sieve::project::loader::{Diagnostic, LoadedProject, load_project_bytes, open_project};
use project_sieve::report::summary::summarize;
use project_sieve::selection::resolve::auto_select_relations;
use project_sieve::selection::state::{SelectionState, style_key};

const PROJECT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE qgis PUBLIC 'http://mrcc.com/qgis.dtd' 'SYSTEM'>
<qgis version="3.34.1" saveUserFull="Cart Ographer" saveDateTime="2024-05-12T09:30:27">
  <projectCrs>
    <spatialrefsys>
      <authid>EPSG:2154</authid>
      <description>RGF93 / Lambert-93</description>
    </spatialrefsys>
  </projectCrs>
  <layer-tree-group>
    <layer-tree-group name="G1">
      <layer-tree-layer id="L1" name="Roads"/>
    </layer-tree-group>
    <layer-tree-group name="G2">
      <layer-tree-layer id="L2" name="Parcels"/>
    </layer-tree-group>
    <layer-tree-layer id="L3" name="Background"/>
  </layer-tree-group>
  <mapcanvas>
    <extent>
      <xmin>842300.5</xmin>
      <ymin>6515200.25</ymin>
      <xmax>861480.75</xmax>
      <ymax>6532990.0</ymax>
    </extent>
  </mapcanvas>
  <projectlayers>
    <maplayer>
      <id>L1</id>
      <layername>Roads</layername>
      <datasource>./data/roads.gpkg|layername=roads</datasource>
      <provider>ogr</provider>
      <srs>
        <spatialrefsys>
          <authid>EPSG:2154</authid>
        </spatialrefsys>
      </srs>
      <map-layer-style-manager current="S1">
        <map-layer-style name="S1"><renderer-v2 type="singleSymbol"/></map-layer-style>
        <map-layer-style name="night"><renderer-v2 type="categorizedSymbol"/></map-layer-style>
      </map-layer-style-manager>
    </maplayer>
    <maplayer>
      <id>L2</id>
      <layername>Parcels</layername>
      <datasource>./data/parcels.shp</datasource>
      <provider>ogr</provider>
      <map-layer-style-manager current="S2">
        <map-layer-style name="S2"><renderer-v2 type="singleSymbol"/></map-layer-style>
      </map-layer-style-manager>
    </maplayer>
    <maplayer>
      <id>L3</id>
      <layername>Background</layername>
      <datasource>https://tiles.example.org/xyz</datasource>
      <provider>wms</provider>
    </maplayer>
  </projectlayers>
  <visibility-presets>
    <visibility-preset name="Day">
      <layer id="L1" style="S1"/>
      <layer id="L3"/>
    </visibility-preset>
    <visibility-preset name="Night">
      <layer id="L1" style="night"/>
      <layer id="ghost" style="x"/>
    </visibility-preset>
    <visibility-preset name="Ghosts">
      <layer id="ghost2"/>
    </visibility-preset>
  </visibility-presets>
  <Layouts>
    <Layout name="Atlas"><PageCollection/></Layout>
    <Layout name="Poster"><PageCollection/></Layout>
  </Layouts>
  <relations>
    <relation name="R1" referencedLayer="L1" referencingLayer="L2">
      <fieldRef referencedField="road_id" referencingField="road_fk"/>
    </relation>
    <relation name="Rghost" referencedLayer="L1" referencingLayer="missing">
      <fieldRef referencedField="id" referencingField="fk"/>
    </relation>
  </relations>
</qgis>
"#;

fn load_fixture() -> LoadedProject {
    load_project_bytes(PROJECT.as_bytes()).expect("fixture should load")
}

fn fixture_graph() -> EntityGraph {
    load_fixture().graph
}

fn tmp_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("project-sieve-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir.join(name)
}

#[test]
fn load_builds_graph_counts_and_metadata() {
    let loaded = load_fixture();
    let g = &loaded.graph;
    assert_eq!(g.layer_count(), 3);
    assert_eq!(g.groups.len(), 2);
    assert_eq!(g.style_count(), 4);
    assert_eq!(g.themes.len(), 3);
    assert_eq!(g.layouts.len(), 2);
    assert_eq!(g.relations.len(), 2);
    assert_eq!(g.roots.len(), 3);

    assert_eq!(g.meta.version.as_deref(), Some("3.34.1"));
    assert_eq!(g.meta.save_user.as_deref(), Some("Cart Ographer"));
    assert_eq!(g.meta.crs_authid.as_deref(), Some("EPSG:2154"));
    let extent = g.meta.extent.expect("extent parsed");
    assert_eq!(extent.xmin, 842300.5);
    assert_eq!(extent.ymax, 6532990.0);

    let roads = g.layer("L1").expect("L1 loaded");
    assert_eq!(roads.name, "Roads");
    assert_eq!(roads.provider.as_deref(), Some("ogr"));
    assert_eq!(roads.crs.as_deref(), Some("EPSG:2154"));
    assert_eq!(roads.current_style, "S1");
    let style_names: Vec<&str> = roads.styles.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(style_names, ["S1", "night"]);
    assert_eq!(roads.parent_group.as_deref(), Some("G1"));

    // A layer without any style information still offers 'default'.
    let background = g.layer("L3").expect("L3 loaded");
    assert_eq!(background.current_style, "default");
    assert_eq!(background.styles.len(), 1);
}

#[test]
fn load_records_unresolved_reference_diagnostics() {
    let loaded = load_fixture();
    assert!(loaded.diagnostics.contains(&Diagnostic::UnresolvedThemeLayer {
        theme: "Night".into(),
        layer: "ghost".into(),
    }));
    assert!(loaded.diagnostics.contains(&Diagnostic::UnresolvedRelationEndpoint {
        relation: "Rghost".into(),
        layer: "missing".into(),
    }));
    // The entities stay in the graph, inert.
    assert!(loaded.graph.theme("Night").is_some());
    assert!(loaded.graph.relation("Rghost").is_some());
}

#[test]
fn load_rejects_malformed_markup() {
    assert!(load_project_bytes(b"<qgis><projectlayers><maplayer><id>L1").is_err());
    // A layer definition without an id names the offending element.
    let err = load_project_bytes(
        b"<qgis><maplayer><layername>x</layername></maplayer></qgis>",
    )
    .unwrap_err();
    assert!(err.to_string().contains("maplayer"));
}

#[test]
fn group_cascade_selects_and_deselects_descendants() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();

    let changed = sel.set(&g, EntityKind::Group, "G1", true);
    assert!(sel.is_selected(&g, EntityKind::Group, "G1"));
    assert!(sel.is_selected(&g, EntityKind::Layer, "L1"));
    assert!(!sel.is_selected(&g, EntityKind::Layer, "L2"));
    assert!(changed.contains(&(EntityKind::Layer, "L1".to_string())));
    // Styles of a now-selected layer are retained by default.
    assert!(sel.is_selected(&g, EntityKind::Style, &style_key("L1", "night")));

    // Selecting a child never selects its ancestor.
    let mut sel2 = SelectionState::new();
    sel2.set(&g, EntityKind::Layer, "L2", true);
    assert!(!sel2.is_selected(&g, EntityKind::Group, "G2"));

    sel.set(&g, EntityKind::Group, "G1", false);
    assert!(!sel.is_selected(&g, EntityKind::Group, "G1"));
    assert!(!sel.is_selected(&g, EntityKind::Layer, "L1"));
}

#[test]
fn set_reports_only_effective_changes() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    let first = sel.set(&g, EntityKind::Layer, "L1", true);
    assert!(first.contains(&(EntityKind::Layer, "L1".to_string())));
    // Re-applying the same mark changes nothing.
    let second = sel.set(&g, EntityKind::Layer, "L1", true);
    assert!(second.is_empty());
}

#[test]
fn theme_selection_unions_with_direct_marks() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Theme, "Day", true);
    assert!(sel.is_selected(&g, EntityKind::Layer, "L1"));
    assert!(sel.is_selected(&g, EntityKind::Layer, "L3"));

    // A direct deselection does not defeat the theme path.
    sel.set(&g, EntityKind::Layer, "L1", false);
    assert!(sel.is_selected(&g, EntityKind::Layer, "L1"));

    // Dropping the theme releases layers with no other active path.
    sel.set(&g, EntityKind::Theme, "Day", false);
    assert!(!sel.is_selected(&g, EntityKind::Layer, "L1"));
    assert!(!sel.is_selected(&g, EntityKind::Layer, "L3"));
}

#[test]
fn relation_auto_select_requires_both_endpoints() {
    let g = fixture_graph();

    // Both endpoints selected: the relation is forced on, even over an
    // explicit deselection.
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    sel.set(&g, EntityKind::Layer, "L2", true);
    sel.set(&g, EntityKind::Relation, "R1", false);
    let forced = auto_select_relations(&g, &mut sel);
    assert_eq!(forced, ["R1"]);
    assert!(sel.is_selected(&g, EntityKind::Relation, "R1"));
    // The unresolved relation is never touched.
    assert!(!sel.is_selected(&g, EntityKind::Relation, "Rghost"));

    // One endpoint missing: the user's mark stands.
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    let forced = auto_select_relations(&g, &mut sel);
    assert!(forced.is_empty());
    assert!(!sel.is_selected(&g, EntityKind::Relation, "R1"));
}

#[test]
fn filter_keeps_ancestor_group_and_prunes_the_rest() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    auto_select_relations(&g, &mut sel);

    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    assert!(pruned.layer("L1").is_some());
    assert!(pruned.layer("L2").is_none());
    assert!(pruned.layer("L3").is_none());
    // G1 survives as the ancestor of a retained leaf; G2 does not.
    assert!(pruned.group("G1").is_some());
    assert!(pruned.group("G2").is_none());
    assert!(pruned.relations.is_empty());
    assert!(pruned.themes.is_empty());
    assert!(pruned.layouts.is_empty());

    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert!(out.contains("<id>L1</id>"));
    assert!(!out.contains("<id>L2</id>"));
    assert!(out.contains(r#"<layer-tree-group name="G1">"#));
    assert!(!out.contains(r#"<layer-tree-group name="G2">"#));
    assert!(!out.contains("visibility-preset"));
    assert!(!out.contains("<relation "));
}

#[test]
fn theme_narrowed_to_nothing_is_dropped() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    sel.set(&g, EntityKind::Theme, "Ghosts", true);
    assert!(sel.is_selected(&g, EntityKind::Theme, "Ghosts"));

    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    assert!(pruned.theme("Ghosts").is_none());
    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert!(!out.contains("Ghosts"));
}

#[test]
fn selected_relation_with_pruned_endpoint_is_dropped() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    // Explicit user override on a half-selected relation is allowed...
    sel.set(&g, EntityKind::Relation, "R1", true);
    auto_select_relations(&g, &mut sel);
    assert!(sel.is_selected(&g, EntityKind::Relation, "R1"));

    // ...but a relation whose endpoint did not survive pruning would dangle.
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    assert!(pruned.relations.is_empty());
    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert!(!out.contains(r#"relation name="R1""#));
}

#[test]
fn style_deselection_narrows_manager_unless_a_theme_pins_it() {
    let g = fixture_graph();

    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    sel.set(&g, EntityKind::Style, &style_key("L1", "night"), false);
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    let names: Vec<&str> =
        pruned.layer("L1").unwrap().styles.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["S1"]);
    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert!(!out.contains(r#"map-layer-style name="night""#));

    // A selected theme pinning the same style wins over the deselection.
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Theme, "Night", true);
    sel.set(&g, EntityKind::Style, &style_key("L1", "night"), false);
    assert!(sel.is_selected(&g, EntityKind::Style, &style_key("L1", "night")));
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    let names: Vec<&str> =
        pruned.layer("L1").unwrap().styles.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["S1", "night"]);
}

#[test]
fn disconnect_rewrites_every_retained_locator() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.select_all(&g);
    auto_select_relations(&g, &mut sel);

    let pruned = filter_graph(&g, &sel, FilterOptions { disconnect_sources: true });
    for layer in &pruned.layers {
        assert_eq!(layer.source.as_deref(), Some(DISCONNECTED_SOURCE));
    }
    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert_eq!(out.matches(DISCONNECTED_SOURCE).count(), 3);
    assert!(!out.contains("roads.gpkg"));

    // Without the flag, locators are copied byte for byte.
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    let out = String::from_utf8(write_project_markup(&pruned).unwrap()).unwrap();
    assert!(out.contains("<datasource>./data/roads.gpkg|layername=roads</datasource>"));
    assert!(out.contains("<datasource>https://tiles.example.org/xyz</datasource>"));
}

#[test]
fn all_selected_round_trip_is_semantically_equivalent() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.select_all(&g);
    auto_select_relations(&g, &mut sel);
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    let out = write_project_markup(&pruned).unwrap();

    let reloaded = load_project_bytes(&out).expect("round-tripped project loads").graph;

    let ids = |g: &EntityGraph| g.layers.iter().map(|l| l.id.clone()).collect::<BTreeSet<_>>();
    assert_eq!(ids(&reloaded), ids(&g));
    for layer in &g.layers {
        let back = reloaded.layer(&layer.id).expect("layer survives");
        assert_eq!(back.name, layer.name);
        assert_eq!(back.source, layer.source);
        let styles = |l: &project_sieve::project::graph::Layer| {
            l.styles.iter().map(|s| s.name.clone()).collect::<BTreeSet<_>>()
        };
        assert_eq!(styles(back), styles(layer));
    }
    assert_eq!(
        reloaded.groups.iter().map(|gr| gr.id.clone()).collect::<BTreeSet<_>>(),
        g.groups.iter().map(|gr| gr.id.clone()).collect::<BTreeSet<_>>(),
    );
    // Resolvable cross-references survive; the dangling ones cannot.
    let day = reloaded.theme("Day").expect("Day survives");
    assert_eq!(day.entries.len(), 2);
    let night = reloaded.theme("Night").expect("Night survives");
    assert_eq!(night.entries.len(), 1);
    assert!(reloaded.theme("Ghosts").is_none());
    assert_eq!(
        reloaded.layouts.iter().map(|l| l.name.clone()).collect::<Vec<_>>(),
        ["Atlas", "Poster"]
    );
    assert_eq!(reloaded.relations.len(), 1);
    assert_eq!(reloaded.relations[0].name, "R1");
    assert_eq!(reloaded.relations[0].fields.len(), 1);
}

#[test]
fn empty_selection_exports_a_schema_complete_project() {
    let g = fixture_graph();
    let sel = SelectionState::new();
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    assert_eq!(pruned.layer_count(), 0);

    let out = write_project_markup(&pruned).unwrap();
    let reloaded = load_project_bytes(&out).expect("empty project still loads").graph;
    assert_eq!(reloaded.layer_count(), 0);
    assert_eq!(reloaded.themes.len(), 0);
    assert_eq!(reloaded.relations.len(), 0);
    // Project-level metadata is untouched.
    assert_eq!(reloaded.meta.crs_authid.as_deref(), Some("EPSG:2154"));
}

#[test]
fn archive_container_round_trip_carries_referenced_resources() {
    // Build the archive variant of the fixture with two auxiliary entries.
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zw = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zw.start_file("project.qgs", options.clone()).unwrap();
        zw.write_all(PROJECT.as_bytes()).unwrap();
        zw.start_file("data/parcels.shp", options.clone()).unwrap();
        zw.write_all(b"shapefile-bytes").unwrap();
        zw.start_file("unused.bin", options.clone()).unwrap();
        zw.write_all(b"orphan").unwrap();
        zw.finish().unwrap();
    }
    let input = tmp_path("container.qgz");
    std::fs::write(&input, cursor.into_inner()).unwrap();

    let loaded = open_project(&input).expect("archive loads");
    assert_eq!(loaded.graph.layer_count(), 3);
    assert_eq!(loaded.graph.aux_resources.len(), 2);

    let mut sel = SelectionState::new();
    sel.select_all(&loaded.graph);
    auto_select_relations(&loaded.graph, &mut sel);
    let pruned = filter_graph(&loaded.graph, &sel, FilterOptions::default());

    let output = tmp_path("filtered.qgz");
    save_filtered_project(&output, &pruned).expect("archive written");

    let bytes = std::fs::read(&output).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let names: BTreeSet<String> =
        (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
    assert!(names.contains("project.qgs"));
    // parcels.shp is still referenced by a retained locator; unused.bin is not.
    assert!(names.contains("data/parcels.shp"));
    assert!(!names.contains("unused.bin"));

    let mut entry = archive.by_name("project.qgs").unwrap();
    let mut markup = Vec::new();
    entry.read_to_end(&mut markup).unwrap();
    let reloaded = load_project_bytes(&markup).expect("exported markup loads").graph;
    assert_eq!(reloaded.layer_count(), 3);
}

#[test]
fn style_and_layout_payloads_export_verbatim() {
    let g = fixture_graph();
    let style = g.style_payload("L1", "night").expect("style payload");
    assert!(style.contains(r#"<map-layer-style name="night">"#));
    assert!(style.contains("categorizedSymbol"));

    let layout = g.layout_payload("Atlas").expect("layout payload");
    assert!(layout.starts_with(r#"<Layout name="Atlas">"#));
    assert!(layout.contains("PageCollection"));

    assert!(g.style_payload("L1", "nope").is_none());
    assert!(g.layout_payload("nope").is_none());
}

#[test]
fn session_marks_replay_to_an_equivalent_selection() {
    let g = fixture_graph();
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Group, "G1", true);
    sel.set(&g, EntityKind::Theme, "Day", true);
    sel.set(&g, EntityKind::Style, &style_key("L1", "night"), false);

    let session = SessionFile::from_runtime(&sel, true);
    let text = ron::ser::to_string_pretty(&session, ron::ser::PrettyConfig::new()).unwrap();
    let session: SessionFile = ron::from_str(&text).unwrap();
    assert!(session.disconnect_sources);

    let replayed = session.apply(&g);
    for kind in [EntityKind::Layer, EntityKind::Style, EntityKind::Theme, EntityKind::Group] {
        assert_eq!(replayed.selected_ids(&g, kind), sel.selected_ids(&g, kind));
    }
}

#[test]
fn summary_reflects_graph_structure() {
    let g = fixture_graph();
    let snapshot = summarize(&g);
    assert_eq!(snapshot.counts.layers, 3);
    assert_eq!(snapshot.counts.styles, 4);
    assert_eq!(snapshot.counts.themes, 3);
    assert_eq!(snapshot.meta.crs_authid.as_deref(), Some("EPSG:2154"));
    assert_eq!(snapshot.layer_tree.len(), 3);

    // Theme nodes resolve layer display names where the layer exists.
    let night = snapshot.themes.iter().find(|t| t.name == "Night").unwrap();
    assert_eq!(night.layers[0].name, "Roads");
    assert_eq!(night.layers[1].name, "ghost");

    let r1 = snapshot.relations.iter().find(|r| r.name == "R1").unwrap();
    assert_eq!(r1.parent.name, "Roads");
    assert_eq!(r1.child.name, "Parcels");
    assert_eq!(r1.parent.fields, ["road_id"]);
    assert_eq!(r1.child.fields, ["road_fk"]);

    // The summary of a pruned graph reflects only what survived.
    let mut sel = SelectionState::new();
    sel.set(&g, EntityKind::Layer, "L1", true);
    let pruned = filter_graph(&g, &sel, FilterOptions::default());
    let snapshot = summarize(&pruned);
    assert_eq!(snapshot.counts.layers, 1);
    assert_eq!(snapshot.counts.groups, 1);
    assert_eq!(snapshot.counts.relations, 0);
}

#[test]
fn tree_entries_preserve_document_order() {
    let g = fixture_graph();
    assert_eq!(
        g.roots,
        [
            TreeEntry::Group("G1".into()),
            TreeEntry::Group("G2".into()),
            TreeEntry::Layer("L3".into()),
        ]
    );
    let g1 = g.group("G1").unwrap();
    assert_eq!(g1.children, [TreeEntry::Layer("L1".into())]);
}
