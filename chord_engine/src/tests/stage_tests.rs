//! Stage-manager construction and activity coverage.

use chord_native::{NativeLibrary, NativeLibraryRegistry};

use crate::buffers::BufferManager;
use crate::constants::ConstantManager;
use crate::program::Program;
use crate::stage::{BufferOrConstant, ProgramStageTaskManager};
use crate::tests::utils::constant_voice_program;

fn constant_voice_stage() -> ProgramStageTaskManager {
    let program = Program::deserialize(&constant_voice_program(1.25, 1)).expect("program loads");
    let registry = NativeLibraryRegistry::with_libraries(Vec::<&NativeLibrary>::new());
    let mut constant_manager = ConstantManager::new();
    let mut buffer_manager = BufferManager::new();

    let graph = program.graph();
    let stage_nodes = graph.voice_graph.as_deref().expect("voice graph");
    let root_nodes = graph.find_graph_root_nodes(stage_nodes);
    ProgramStageTaskManager::new(
        &registry,
        Box::new(|_, _| {}),
        &program,
        true,
        &mut constant_manager,
        &mut buffer_manager,
        64,
        None,
        None,
        None,
        0,
        &root_nodes,
    )
}

#[test]
fn constant_outputs_resolve_at_construction() {
    let stage = constant_voice_stage();
    assert_eq!(stage.output_count(), 1);
    assert!(matches!(
        stage.resolved_output(0),
        BufferOrConstant::Float(value) if value == 1.25
    ));
    assert_eq!(stage.scratch_memory_requirement().size, 0);
}

#[test]
fn activity_toggles() {
    let stage = constant_voice_stage();
    assert!(!stage.is_active());
    stage.set_active(true);
    assert!(stage.is_active());
    stage.set_active(false);
    assert!(!stage.is_active());
}

#[test]
#[should_panic]
fn redundant_activation_is_rejected() {
    let stage = constant_voice_stage();
    stage.set_active(true);
    // The state change must be real
    stage.set_active(true);
}
