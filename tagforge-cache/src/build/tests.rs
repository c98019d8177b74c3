use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::build::workload::{BuildTag, PointerDescriptor, PointerKind};
use crate::build::{writer, BuildError, BuildParameters, BuildWorkload, EffectFlags, MAX_TAGS};
use crate::engine::Engine;
use crate::map::{LoadOptions, Map, MapTag};
use crate::script::compiler::{node_table, ScriptCompileError, ScriptCompiler, ScriptNode, ScriptNodeFlags, ScriptValueType};
use crate::script::{NodeTableCompiler, Token};
use crate::tag::file::TagFileBuilder;
use crate::tag::schema::{BuiltinSchemas, DependencyClass, FieldDef, SchemaProvider, StructLayout, TagSchema};
use crate::tag::source::MemoryTagSource;
use crate::tag::{TagClass, TagId};

const SCENARIO: &str = "levels/test/test";

/// Scenario -> weapon -> (effect -> [damage, light], damage), scenery.
fn demo_source() -> MemoryTagSource {
    let mut source = MemoryTagSource::new();

    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(2);
    scenario.dependency(Some((TagClass::Weapon, "weapons/pistol")));
    scenario.dependency(Some((TagClass::Scenery, "scenery/rock")));
    scenario.data(b"(sleep 30)\n");
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let mut weapon = TagFileBuilder::new(TagClass::Weapon);
    weapon.f32(1.5);
    weapon.dependency(Some((TagClass::Effect, "effects/muzzle")));
    weapon.dependency(Some((TagClass::DamageEffect, "damage/bullet")));
    source.insert("weapons/pistol", TagClass::Weapon, weapon.finish());

    let mut scenery = TagFileBuilder::new(TagClass::Scenery);
    scenery.f32(3.0);
    scenery.dependency(None);
    source.insert("scenery/rock", TagClass::Scenery, scenery.finish());

    let mut effect = TagFileBuilder::new(TagClass::Effect);
    effect.u32(0);
    effect.f32(0.0);
    effect.block_count(1);
    effect.f32(0.0); // delay_lower
    effect.f32(0.25); // delay_upper
    effect.block_count(2);
    effect.fourcc(0);
    effect.dependency(Some((TagClass::DamageEffect, "damage/bullet")));
    effect.fourcc(0);
    effect.dependency(Some((TagClass::Light, "lights/glow")));
    source.insert("effects/muzzle", TagClass::Effect, effect.finish());

    let mut damage = TagFileBuilder::new(TagClass::DamageEffect);
    damage.f32(5.0).f32(10.0).f32(1.0).u32(0);
    source.insert("damage/bullet", TagClass::DamageEffect, damage.finish());

    let mut light = TagFileBuilder::new(TagClass::Light);
    light.f32(50.0).f32(1.0).u32(0x00FF_FFFF);
    source.insert("lights/glow", TagClass::Light, light.finish());

    source
}

/// Scenario referencing a single sound with the given channel count.
fn sound_source(channels: u32) -> MemoryTagSource {
    let mut source = MemoryTagSource::new();

    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(1);
    scenario.dependency(Some((TagClass::Sound, "sounds/ding")));
    scenario.data(&[]);
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let mut sound = TagFileBuilder::new(TagClass::Sound);
    sound.f32(0.5).f32(1.0).u32(channels);
    source.insert("sounds/ding", TagClass::Sound, sound.finish());

    source
}

fn compile_with(source: &mut MemoryTagSource, params: &BuildParameters) -> Result<Vec<u8>, BuildError> {
    let schemas = BuiltinSchemas::new();
    let compiler = NodeTableCompiler::new();
    BuildWorkload::compile_map(SCENARIO, source, &schemas, &compiler, params)
}

fn load(data: Vec<u8>) -> Map {
    Map::load(data, Vec::new(), Vec::new(), Vec::new(), &LoadOptions::default()).expect("load map")
}

fn find<'a>(map: &'a Map, path: &str) -> &'a MapTag {
    map.tags()
        .iter()
        .find(|t| t.path == path)
        .unwrap_or_else(|| panic!("tag {} missing from the map", path))
}

fn tag_struct<'a>(map: &'a Map, tag: &MapTag) -> &'a [u8] {
    map.get_tag_data_at_offset(tag.data_offset.expect("tag is embedded") as usize, 4)
        .expect("tag struct in bounds")
}

#[test]
fn round_trip_preserves_the_logical_graph() -> Result<(), anyhow::Error> {
    let params = BuildParameters::new(Engine::Retail);
    let map = load(compile_with(&mut demo_source(), &params)?);

    assert_eq!(map.engine(), Engine::Retail);
    assert_eq!(map.header().scenario_name, "test");
    assert_eq!(map.tag_count(), 6);
    assert!(!map.is_compressed());
    assert!(!map.is_protected());

    let scenario = find(&map, SCENARIO);
    assert_eq!(scenario.class, TagClass::Scenario);
    assert_eq!(map.scenario_tag(), Some(0));
    assert_eq!(scenario.id, TagId::new(0));

    let weapon = find(&map, "weapons/pistol");
    assert_eq!(weapon.class, TagClass::Weapon);
    assert_eq!(LittleEndian::read_f32(tag_struct(&map, weapon)), 1.5);

    let damage = find(&map, "damage/bullet");
    let damage_struct = tag_struct(&map, damage);
    assert_eq!(LittleEndian::read_f32(&damage_struct[0..4]), 5.0);
    assert_eq!(LittleEndian::read_f32(&damage_struct[4..8]), 10.0);

    let scenery = find(&map, "scenery/rock");
    assert_eq!(LittleEndian::read_f32(tag_struct(&map, scenery)), 3.0);

    // The weapon's impact dependency resolved to the damage tag's id.
    let weapon_struct = tag_struct(&map, weapon);
    let impact_id = TagId::from_u32(LittleEndian::read_u32(&weapon_struct[32..36]));
    assert_eq!(map.tag(impact_id.index as usize).expect("impact tag").path, "damage/bullet");
    Ok(())
}

#[test]
fn identical_inputs_compile_to_identical_bytes() -> Result<(), anyhow::Error> {
    let params = BuildParameters::new(Engine::Retail);
    let first = compile_with(&mut demo_source(), &params)?;
    let second = compile_with(&mut demo_source(), &params)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn effect_hook_aggregates_radius_and_determinism() -> Result<(), anyhow::Error> {
    let params = BuildParameters::new(Engine::Retail);
    let map = load(compile_with(&mut demo_source(), &params)?);

    let effect = find(&map, "effects/muzzle");
    let effect_struct = tag_struct(&map, effect);
    let flags = EffectFlags::from_bits_retain(LittleEndian::read_u32(&effect_struct[0..4]));
    assert!(flags.contains(EffectFlags::MUST_BE_DETERMINISTIC));
    assert!(!flags.contains(EffectFlags::MUST_BE_DETERMINISTIC_CONSOLE));
    // Only the damage-effect part contributes; the light's radius of 50 does not.
    assert_eq!(LittleEndian::read_f32(&effect_struct[4..8]), 10.0);

    // The parts were classified by their resolved dependency class.
    let events_pointer = LittleEndian::read_u32(&effect_struct[12..16]);
    let event = map.resolve_tag_data_pointer(events_pointer, 20)?;
    let parts_pointer = LittleEndian::read_u32(&event[12..16]);
    let parts = map.resolve_tag_data_pointer(parts_pointer, 40)?;
    assert_eq!(&parts[0..4], b"dmgf");
    assert_eq!(&parts[20..24], b"lght");
    Ok(())
}

#[test]
fn disable_recursion_degrades_the_effect_hook_to_a_noop() -> Result<(), anyhow::Error> {
    let mut params = BuildParameters::new(Engine::Retail);
    params.disable_recursion = true;
    let map = load(compile_with(&mut demo_source(), &params)?);

    let effect_struct = tag_struct(&map, find(&map, "effects/muzzle"));
    assert_eq!(LittleEndian::read_u32(&effect_struct[0..4]), 0);
    assert_eq!(LittleEndian::read_f32(&effect_struct[4..8]), 0.0);
    Ok(())
}

struct StubCompiler(Vec<u8>);

impl ScriptCompiler for StubCompiler {
    fn compile(&self, _tokens: &[Token]) -> Result<Vec<u8>, ScriptCompileError> {
        Ok(self.0.clone())
    }
}

#[test]
fn scenario_hook_redacts_reference_nodes_only() -> Result<(), anyhow::Error> {
    let mut table = node_table::build(&[
        ScriptNode {
            value_type: u16::from(ScriptValueType::Sound),
            flags: ScriptNodeFlags::GLOBAL,
            next: 1,
            string_offset: 0,
            data: 0x1111,
        },
        ScriptNode {
            value_type: u16::from(ScriptValueType::Effect),
            flags: ScriptNodeFlags::empty(),
            next: 2,
            string_offset: 0,
            data: 0x2222,
        },
        ScriptNode {
            value_type: 0x0063,
            flags: ScriptNodeFlags::empty(),
            next: u32::MAX,
            string_offset: 0,
            data: 0x3333,
        },
    ]);
    node_table::set_first_element(&mut table, 0xDEAD_BEEF);

    let mut source = MemoryTagSource::new();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(0);
    scenario.data(b"(x)\n");
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let schemas = BuiltinSchemas::new();
    let compiler = StubCompiler(table);
    let params = BuildParameters::new(Engine::Retail);
    let data = BuildWorkload::compile_map(SCENARIO, &mut source, &schemas, &compiler, &params)?;
    let map = load(data);

    let scenario_struct = tag_struct(&map, find(&map, SCENARIO));
    let syntax_pointer = LittleEndian::read_u32(&scenario_struct[44..48]);
    let compiled = map.resolve_tag_data_pointer(syntax_pointer, 64)?;

    // Detached from absolute addressing.
    assert_eq!(node_table::first_element(compiled), 0);
    // Global-flagged sound node: untouched.
    assert_eq!(node_table::read_node(compiled, 0).data, 0x1111);
    // Plain effect node: nulled.
    assert_eq!(node_table::read_node(compiled, 1).data, 0xFFFF_FFFF);
    // Unrecognized type: skipped.
    assert_eq!(node_table::read_node(compiled, 2).data, 0x3333);
    Ok(())
}

#[test]
fn forged_crc_replaces_only_the_header_field() -> Result<(), anyhow::Error> {
    let honest = compile_with(&mut demo_source(), &BuildParameters::new(Engine::Retail))?;

    let mut params = BuildParameters::new(Engine::Retail);
    params.forged_crc = Some(0xDEAD_BEEF);
    let forged = compile_with(&mut demo_source(), &params)?;

    assert_eq!(honest.len(), forged.len());
    assert_eq!(LittleEndian::read_u32(&forged[28..32]), 0xDEAD_BEEF);
    assert_eq!(&honest[..28], &forged[..28]);
    assert_eq!(&honest[32..], &forged[32..]);

    // Enforcing loaders reject the forgery, lenient ones accept it.
    let strict = Map::load(
        forged.clone(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        &LoadOptions::default(),
    );
    assert!(matches!(strict, Err(crate::map::MapError::ChecksumMismatch { .. })));

    let lenient = Map::load(
        forged,
        Vec::new(),
        Vec::new(),
        Vec::new(),
        &LoadOptions {
            verify_checksum: false,
        },
    )?;
    assert_eq!(lenient.tag_count(), 6);
    Ok(())
}

#[test]
fn unresolved_dependency_is_fatal() {
    let mut source = demo_source();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(1);
    scenario.dependency(Some((TagClass::Weapon, "weapons/missing")));
    scenario.data(&[]);
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let error = compile_with(&mut source, &BuildParameters::new(Engine::Retail))
        .expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::UnresolvedDependency { ref path, class: TagClass::Weapon } if path == "weapons/missing"
    ));
}

#[test]
fn wrong_class_at_the_source_is_fatal() {
    let mut source = MemoryTagSource::new();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(1);
    scenario.dependency(Some((TagClass::Weapon, "props/crate")));
    scenario.data(&[]);
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let mut scenery = TagFileBuilder::new(TagClass::Scenery);
    scenery.f32(1.0);
    scenery.dependency(None);
    source.insert("props/crate", TagClass::Scenery, scenery.finish());

    let error = compile_with(&mut source, &BuildParameters::new(Engine::Retail))
        .expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::WrongTagClass { found: TagClass::Scenery, .. }
    ));
}

#[test]
fn dependency_class_must_match_the_schema() {
    let mut source = demo_source();
    // A weapon whose fire effect claims to be a light.
    let mut weapon = TagFileBuilder::new(TagClass::Weapon);
    weapon.f32(1.5);
    weapon.dependency(Some((TagClass::Light, "lights/glow")));
    weapon.dependency(None);
    source.insert("weapons/pistol", TagClass::Weapon, weapon.finish());

    let error = compile_with(&mut source, &BuildParameters::new(Engine::Retail))
        .expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::WrongTagClass { found: TagClass::Light, .. }
    ));
}

struct TestSchemas(Vec<TagSchema>);

impl SchemaProvider for TestSchemas {
    fn schema(&self, class: TagClass) -> Option<&TagSchema> {
        self.0.iter().find(|s| s.class == class)
    }
}

#[test]
fn effect_chains_may_not_cycle() {
    let schemas = TestSchemas(vec![
        TagSchema {
            class: TagClass::Scenario,
            layout: StructLayout::new(
                "scenario",
                4,
                vec![FieldDef::Dependency {
                    name: "entry",
                    expected: DependencyClass::Exact(TagClass::Effect),
                }],
            ),
        },
        TagSchema {
            class: TagClass::Effect,
            layout: StructLayout::new(
                "effect",
                4,
                vec![FieldDef::Dependency {
                    name: "chain",
                    expected: DependencyClass::Exact(TagClass::Effect),
                }],
            ),
        },
    ]);

    let mut source = MemoryTagSource::new();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.dependency(Some((TagClass::Effect, "fx/a")));
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());
    let mut a = TagFileBuilder::new(TagClass::Effect);
    a.dependency(Some((TagClass::Effect, "fx/b")));
    source.insert("fx/a", TagClass::Effect, a.finish());
    let mut b = TagFileBuilder::new(TagClass::Effect);
    b.dependency(Some((TagClass::Effect, "fx/a")));
    source.insert("fx/b", TagClass::Effect, b.finish());

    let params = BuildParameters::new(Engine::Retail);
    let compiler = NodeTableCompiler::new();
    let error = BuildWorkload::compile_map(SCENARIO, &mut source, &schemas, &compiler, &params)
        .expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::DependencyCycleUnsafe { ref path, class: TagClass::Effect } if path == "fx/a"
    ));
}

#[test]
fn actor_variant_cycles_are_legal() -> Result<(), anyhow::Error> {
    let mut source = MemoryTagSource::new();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(1);
    scenario.dependency(Some((TagClass::ActorVariant, "actors/elite")));
    scenario.data(&[]);
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    let mut elite = TagFileBuilder::new(TagClass::ActorVariant);
    elite.f32(10.0);
    elite.dependency(Some((TagClass::ActorVariant, "actors/elite_major")));
    source.insert("actors/elite", TagClass::ActorVariant, elite.finish());

    let mut major = TagFileBuilder::new(TagClass::ActorVariant);
    major.f32(12.0);
    major.dependency(Some((TagClass::ActorVariant, "actors/elite")));
    source.insert("actors/elite_major", TagClass::ActorVariant, major.finish());

    let map = load(compile_with(&mut source, &BuildParameters::new(Engine::Retail))?);
    assert_eq!(map.tag_count(), 3);

    // The mutual references resolved to each other's ids, including the
    // forward reference back into the in-progress tag.
    let elite_tag = find(&map, "actors/elite");
    let major_tag = find(&map, "actors/elite_major");
    let elite_struct = tag_struct(&map, elite_tag);
    let major_struct = tag_struct(&map, major_tag);
    assert_eq!(
        TagId::from_u32(LittleEndian::read_u32(&elite_struct[16..20])),
        major_tag.id
    );
    assert_eq!(
        TagId::from_u32(LittleEndian::read_u32(&major_struct[16..20])),
        elite_tag.id
    );
    Ok(())
}

#[test]
fn stock_tags_are_emitted_as_index_references() -> Result<(), anyhow::Error> {
    let mut params = BuildParameters::new(Engine::Retail);
    params.index = Some(vec![(TagClass::Sound, "sounds/ding".to_owned())]);
    let map = load(compile_with(&mut sound_source(2), &params)?);

    let sound = find(&map, "sounds/ding");
    assert_eq!(sound.indexed_id, Some(0));
    assert_eq!(sound.data_offset, None);
    Ok(())
}

#[test]
fn always_index_requires_the_tag_to_be_present() {
    let mut params = BuildParameters::new(Engine::Retail);
    params.index = Some(Vec::new());
    params.always_index = true;
    let error =
        compile_with(&mut sound_source(2), &params).expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::MissingIndexedTag { ref path, class: TagClass::Sound } if path == "sounds/ding"
    ));
}

#[test]
fn console_target_swaps_byte_order_and_narrows_indices() -> Result<(), anyhow::Error> {
    let map = load(compile_with(&mut sound_source(2), &BuildParameters::new(Engine::Console))?);

    assert_eq!(map.engine(), Engine::Console);
    assert_eq!(map.tag_count(), 2);
    assert_eq!(map.header().base_memory_address, 0x803A_6000);

    let sound_struct = tag_struct(&map, find(&map, "sounds/ding"));
    assert_eq!(BigEndian::read_f32(&sound_struct[0..4]), 0.5);
    assert_eq!(BigEndian::read_f32(&sound_struct[4..8]), 1.0);
    // channel_count narrowed to a big-endian u16
    assert_eq!(BigEndian::read_u16(&sound_struct[8..10]), 2);
    Ok(())
}

#[test]
fn console_target_rejects_out_of_range_indices() {
    let error = compile_with(&mut sound_source(0x1_0000), &BuildParameters::new(Engine::Console))
        .expect_err("must not compile");
    assert!(matches!(
        error,
        BuildError::EngineIncompatibleValue {
            field: "channel_count",
            value: 0x1_0000,
            ..
        }
    ));
}

#[test]
fn wide_indices_are_fine_on_desktop_targets() -> Result<(), anyhow::Error> {
    let map = load(compile_with(&mut sound_source(0x1_0000), &BuildParameters::new(Engine::Retail))?);
    let sound_struct = tag_struct(&map, find(&map, "sounds/ding"));
    assert_eq!(LittleEndian::read_u32(&sound_struct[8..12]), 0x1_0000);
    Ok(())
}

#[test]
fn compressed_bodies_round_trip() -> Result<(), anyhow::Error> {
    let mut params = BuildParameters::new(Engine::Retail);
    params.compress = true;
    let plain = compile_with(&mut demo_source(), &BuildParameters::new(Engine::Retail))?;
    let compressed = compile_with(&mut demo_source(), &params)?;

    assert_ne!(plain.len(), compressed.len());

    let map = load(compressed);
    assert!(map.is_compressed());
    assert_eq!(map.tag_count(), 6);
    let damage_struct = tag_struct(&map, find(&map, "damage/bullet"));
    assert_eq!(LittleEndian::read_f32(&damage_struct[4..8]), 10.0);
    Ok(())
}

#[test]
fn optimize_space_merges_identical_structs() -> Result<(), anyhow::Error> {
    let mut source = MemoryTagSource::new();
    let mut scenario = TagFileBuilder::new(TagClass::Scenario);
    scenario.u32(0);
    scenario.block_count(2);
    scenario.dependency(Some((TagClass::DamageEffect, "damage/a")));
    scenario.dependency(Some((TagClass::DamageEffect, "damage/b")));
    scenario.data(&[]);
    scenario.data(&[]);
    source.insert(SCENARIO, TagClass::Scenario, scenario.finish());

    for path in ["damage/a", "damage/b"] {
        let mut damage = TagFileBuilder::new(TagClass::DamageEffect);
        damage.f32(5.0).f32(10.0).f32(1.0).u32(0);
        source.insert(path, TagClass::DamageEffect, damage.finish());
    }

    let plain = load(compile_with(&mut source, &BuildParameters::new(Engine::Retail))?);
    assert_ne!(
        find(&plain, "damage/a").data_offset,
        find(&plain, "damage/b").data_offset
    );

    let mut params = BuildParameters::new(Engine::Retail);
    params.optimize_space = true;
    let optimized = load(compile_with(&mut source, &params)?);
    assert_eq!(
        find(&optimized, "damage/a").data_offset,
        find(&optimized, "damage/b").data_offset
    );
    Ok(())
}

#[test]
fn dangling_descriptors_never_serialize() {
    let mut source = demo_source();
    let schemas = BuiltinSchemas::new();
    let compiler = NodeTableCompiler::new();
    let params = BuildParameters::new(Engine::Retail);
    let mut workload = BuildWorkload::new(&mut source, &schemas, &compiler, &params);
    workload
        .import_tag(SCENARIO, TagClass::Scenario)
        .expect("import");
    workload.scenario_tag = Some(0);

    for pointer in &workload.structs[0].pointers {
        assert!(pointer.target < workload.structs.len());
    }

    workload.structs[0].pointers.push(PointerDescriptor {
        offset: 8,
        target: 9999,
        kind: PointerKind::DataPayload,
    });
    let error = writer::serialize(&mut workload).expect_err("must not serialize");
    assert!(matches!(
        error,
        BuildError::DanglingPointer { from: 0, target: 9999 }
    ));
}

#[test]
fn oversized_structs_are_rejected() {
    let mut source = demo_source();
    let schemas = BuiltinSchemas::new();
    let compiler = NodeTableCompiler::new();
    let params = BuildParameters::new(Engine::Retail);
    let mut workload = BuildWorkload::new(&mut source, &schemas, &compiler, &params);
    workload
        .import_tag(SCENARIO, TagClass::Scenario)
        .expect("import");
    workload.scenario_tag = Some(0);

    let too_big = Engine::Retail.max_tag_space() + 1;
    workload
        .alloc_struct(Vec::new(), too_big, 4, false)
        .expect("alloc");
    let error = writer::serialize(&mut workload).expect_err("must not serialize");
    assert!(matches!(error, BuildError::StructTooLarge { .. }));
}

#[test]
fn the_tag_arena_is_bounded() {
    let mut source = demo_source();
    let schemas = BuiltinSchemas::new();
    let compiler = NodeTableCompiler::new();
    let params = BuildParameters::new(Engine::Retail);
    let mut workload = BuildWorkload::new(&mut source, &schemas, &compiler, &params);
    for i in 0..MAX_TAGS {
        workload.tags.push(BuildTag {
            path: format!("filler/{}", i),
            class: TagClass::Bitmap,
            root_struct: None,
            dependencies: Vec::new(),
            in_progress: false,
            indexed: Some(0),
        });
    }
    let error = workload
        .import_tag(SCENARIO, TagClass::Scenario)
        .expect_err("must not import");
    assert!(matches!(error, BuildError::TooManyTags { .. }));
}
