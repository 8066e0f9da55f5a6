//! The immutable program graph.
//!
//! Input↔Output↔Processor references form cycles, so the graph is stored as
//! typed node pools with index references instead of a pointer web. The
//! codec's two-pass allocation (count, reserve, fill) lets references resolve
//! before the referenced node is materialized.

use std::collections::{HashMap, HashSet};

use chord_native::PrimitiveType;
use chord_primitives::Guid;

/// Index of an [`InputNode`] in the graph's input pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InputNodeRef(pub(crate) u32);

/// Index of an [`OutputNode`] in the graph's output pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OutputNodeRef(pub(crate) u32);

/// Reference to a processor node: the node's type tag plus its index in the
/// per-type pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ProcessorNodeRef {
    FloatConstant(u32),
    DoubleConstant(u32),
    IntConstant(u32),
    BoolConstant(u32),
    StringConstant(u32),
    Array(u32),
    NativeModuleCall(u32),
    GraphInput(u32),
    GraphOutput(u32),
}

/// Consumer side of an edge. Owned by exactly one processor node and
/// connected to exactly one output.
#[derive(Default, Debug, PartialEq)]
pub struct InputNode {
    pub(crate) processor: Option<ProcessorNodeRef>,
    pub(crate) connection: Option<OutputNodeRef>,
}

impl InputNode {
    pub fn processor(&self) -> ProcessorNodeRef {
        self.processor.expect("validated at load")
    }

    pub fn connection(&self) -> OutputNodeRef {
        self.connection.expect("validated at load")
    }
}

/// Producer side of an edge. Owned by exactly one processor node; connected
/// to zero or more inputs.
#[derive(Default, Debug, PartialEq)]
pub struct OutputNode {
    pub(crate) processor: Option<ProcessorNodeRef>,
    pub(crate) connections: Vec<InputNodeRef>,
}

impl OutputNode {
    pub fn processor(&self) -> ProcessorNodeRef {
        self.processor.expect("validated at load")
    }

    pub fn connections(&self) -> &[InputNodeRef] {
        &self.connections
    }
}

#[derive(Debug, PartialEq)]
pub struct FloatConstantNode {
    pub value: f32,
    pub output: OutputNodeRef,
}

#[derive(Debug, PartialEq)]
pub struct DoubleConstantNode {
    pub value: f64,
    pub output: OutputNodeRef,
}

#[derive(Debug, PartialEq)]
pub struct IntConstantNode {
    pub value: i32,
    pub output: OutputNodeRef,
}

#[derive(Debug, PartialEq)]
pub struct BoolConstantNode {
    pub value: bool,
    pub output: OutputNodeRef,
}

/// An immutable UTF-32 sequence.
#[derive(Debug, PartialEq)]
pub struct StringConstantNode {
    pub value: Vec<u32>,
    pub output: OutputNodeRef,
}

/// Element count is fixed at construction.
#[derive(Debug, PartialEq)]
pub struct ArrayNode {
    pub elements: Vec<InputNodeRef>,
    pub output: OutputNodeRef,
}

#[derive(Debug, PartialEq)]
pub struct NativeModuleCallNode {
    pub native_library_id: Guid,
    pub native_module_id: Guid,
    pub upsample_factor: i32,
    pub inputs: Vec<InputNodeRef>,
    pub outputs: Vec<OutputNodeRef>,
}

#[derive(Debug, PartialEq)]
pub struct GraphInputNode {
    pub output: OutputNodeRef,
}

#[derive(Debug, PartialEq)]
pub struct GraphOutputNode {
    pub input: InputNodeRef,
}

/// Typed node pools plus the channel and stage tables decoded from the
/// program payload. Immutable after load; safe to read concurrently.
#[derive(Default, Debug, PartialEq)]
pub struct ProgramGraph {
    pub(crate) input_nodes: Vec<InputNode>,
    pub(crate) output_nodes: Vec<OutputNode>,
    pub(crate) float_constant_nodes: Vec<FloatConstantNode>,
    pub(crate) double_constant_nodes: Vec<DoubleConstantNode>,
    pub(crate) int_constant_nodes: Vec<IntConstantNode>,
    pub(crate) bool_constant_nodes: Vec<BoolConstantNode>,
    pub(crate) string_constant_nodes: Vec<StringConstantNode>,
    pub(crate) array_nodes: Vec<ArrayNode>,
    pub(crate) native_module_call_nodes: Vec<NativeModuleCallNode>,
    pub(crate) graph_input_nodes: Vec<GraphInputNode>,
    pub(crate) graph_output_nodes: Vec<GraphOutputNode>,

    /// GraphInput nodes backing the float input channels, if present.
    pub input_channels_float: Option<Vec<ProcessorNodeRef>>,
    /// GraphInput nodes backing the double input channels, if present.
    pub input_channels_double: Option<Vec<ProcessorNodeRef>>,
    /// GraphOutput nodes backing the output channels.
    pub output_channels: Vec<ProcessorNodeRef>,
    pub voice_remain_active: Option<ProcessorNodeRef>,
    pub effect_remain_active: Option<ProcessorNodeRef>,
    pub voice_to_effect_primitive_types: Vec<PrimitiveType>,
    /// Voice-stage GraphOutputs feeding the voice-to-effect channels.
    pub voice_to_effect_outputs: Vec<ProcessorNodeRef>,
    /// Effect-stage GraphInputs fed by the voice-to-effect channels.
    pub voice_to_effect_inputs: Vec<ProcessorNodeRef>,
    /// Terminal processor nodes of the voice stage, if present.
    pub voice_graph: Option<Vec<ProcessorNodeRef>>,
    /// Terminal processor nodes of the effect stage, if present.
    pub effect_graph: Option<Vec<ProcessorNodeRef>>,
}

impl ProgramGraph {
    pub fn input_node(&self, node: InputNodeRef) -> &InputNode {
        &self.input_nodes[node.0 as usize]
    }

    pub fn output_node(&self, node: OutputNodeRef) -> &OutputNode {
        &self.output_nodes[node.0 as usize]
    }

    pub fn float_constant_node(&self, node: ProcessorNodeRef) -> &FloatConstantNode {
        let ProcessorNodeRef::FloatConstant(index) = node else {
            panic!("not a float constant node");
        };
        &self.float_constant_nodes[index as usize]
    }

    pub fn double_constant_node(&self, node: ProcessorNodeRef) -> &DoubleConstantNode {
        let ProcessorNodeRef::DoubleConstant(index) = node else {
            panic!("not a double constant node");
        };
        &self.double_constant_nodes[index as usize]
    }

    pub fn int_constant_node(&self, node: ProcessorNodeRef) -> &IntConstantNode {
        let ProcessorNodeRef::IntConstant(index) = node else {
            panic!("not an int constant node");
        };
        &self.int_constant_nodes[index as usize]
    }

    pub fn bool_constant_node(&self, node: ProcessorNodeRef) -> &BoolConstantNode {
        let ProcessorNodeRef::BoolConstant(index) = node else {
            panic!("not a bool constant node");
        };
        &self.bool_constant_nodes[index as usize]
    }

    pub fn string_constant_node(&self, node: ProcessorNodeRef) -> &StringConstantNode {
        let ProcessorNodeRef::StringConstant(index) = node else {
            panic!("not a string constant node");
        };
        &self.string_constant_nodes[index as usize]
    }

    pub fn array_node(&self, node: ProcessorNodeRef) -> &ArrayNode {
        let ProcessorNodeRef::Array(index) = node else {
            panic!("not an array node");
        };
        &self.array_nodes[index as usize]
    }

    pub fn native_module_call_node(&self, node: ProcessorNodeRef) -> &NativeModuleCallNode {
        let ProcessorNodeRef::NativeModuleCall(index) = node else {
            panic!("not a native module call node");
        };
        &self.native_module_call_nodes[index as usize]
    }

    pub fn graph_input_node(&self, node: ProcessorNodeRef) -> &GraphInputNode {
        let ProcessorNodeRef::GraphInput(index) = node else {
            panic!("not a graph input node");
        };
        &self.graph_input_nodes[index as usize]
    }

    pub fn graph_output_node(&self, node: ProcessorNodeRef) -> &GraphOutputNode {
        let ProcessorNodeRef::GraphOutput(index) = node else {
            panic!("not a graph output node");
        };
        &self.graph_output_nodes[index as usize]
    }

    pub fn for_each_processor_input(
        &self,
        node: ProcessorNodeRef,
        mut visit: impl FnMut(InputNodeRef),
    ) {
        match node {
            ProcessorNodeRef::FloatConstant(_)
            | ProcessorNodeRef::DoubleConstant(_)
            | ProcessorNodeRef::IntConstant(_)
            | ProcessorNodeRef::BoolConstant(_)
            | ProcessorNodeRef::StringConstant(_)
            | ProcessorNodeRef::GraphInput(_) => {}
            ProcessorNodeRef::Array(_) => {
                for &element in &self.array_node(node).elements {
                    visit(element);
                }
            }
            ProcessorNodeRef::NativeModuleCall(_) => {
                for &input in &self.native_module_call_node(node).inputs {
                    visit(input);
                }
            }
            ProcessorNodeRef::GraphOutput(_) => visit(self.graph_output_node(node).input),
        }
    }

    pub fn for_each_processor_output(
        &self,
        node: ProcessorNodeRef,
        mut visit: impl FnMut(OutputNodeRef),
    ) {
        match node {
            ProcessorNodeRef::FloatConstant(_) => visit(self.float_constant_node(node).output),
            ProcessorNodeRef::DoubleConstant(_) => visit(self.double_constant_node(node).output),
            ProcessorNodeRef::IntConstant(_) => visit(self.int_constant_node(node).output),
            ProcessorNodeRef::BoolConstant(_) => visit(self.bool_constant_node(node).output),
            ProcessorNodeRef::StringConstant(_) => visit(self.string_constant_node(node).output),
            ProcessorNodeRef::Array(_) => visit(self.array_node(node).output),
            ProcessorNodeRef::NativeModuleCall(_) => {
                for &output in &self.native_module_call_node(node).outputs {
                    visit(output);
                }
            }
            ProcessorNodeRef::GraphInput(_) => visit(self.graph_input_node(node).output),
            ProcessorNodeRef::GraphOutput(_) => {}
        }
    }

    pub fn node_input_count(&self, node: ProcessorNodeRef) -> usize {
        let mut count = 0;
        self.for_each_processor_input(node, |_| count += 1);
        count
    }

    fn for_each_predecessor(&self, node: ProcessorNodeRef, mut visit: impl FnMut(ProcessorNodeRef)) {
        self.for_each_processor_input(node, |input| {
            let connection = self.input_node(input).connection();
            visit(self.output_node(connection).processor());
        });
    }

    fn for_each_successor(&self, node: ProcessorNodeRef, mut visit: impl FnMut(ProcessorNodeRef)) {
        self.for_each_processor_output(node, |output| {
            for &input in self.output_node(output).connections() {
                visit(self.input_node(input).processor());
            }
        });
    }

    /// Finds the source nodes (no inputs) of the sub-graph terminating at
    /// `output_nodes`, by backward traversal.
    pub fn find_graph_root_nodes(&self, output_nodes: &[ProcessorNodeRef]) -> Vec<ProcessorNodeRef> {
        let mut visited: HashSet<ProcessorNodeRef> = HashSet::new();
        let mut node_stack: Vec<ProcessorNodeRef> = Vec::with_capacity(output_nodes.len());
        for &node in output_nodes {
            if visited.insert(node) {
                node_stack.push(node);
            }
        }

        let mut root_nodes = Vec::new();
        while let Some(node) = node_stack.pop() {
            if self.node_input_count(node) == 0 {
                root_nodes.push(node);
            } else {
                self.for_each_predecessor(node, |predecessor| {
                    if visited.insert(predecessor) {
                        node_stack.push(predecessor);
                    }
                });
            }
        }

        root_nodes
    }

    /// Visits every node forward-reachable from `root_nodes` in topological
    /// order: a node is visited only after all of its predecessors within
    /// the reachable sub-graph.
    pub fn iterate_graph_topological(
        &self,
        root_nodes: &[ProcessorNodeRef],
        mut visit: impl FnMut(ProcessorNodeRef),
    ) {
        // Forward closure of the roots
        let mut reachable: HashSet<ProcessorNodeRef> = HashSet::new();
        let mut node_stack: Vec<ProcessorNodeRef> = Vec::with_capacity(root_nodes.len());
        for &node in root_nodes {
            if reachable.insert(node) {
                node_stack.push(node);
            }
        }
        while let Some(node) = node_stack.pop() {
            self.for_each_successor(node, |successor| {
                if reachable.insert(successor) {
                    node_stack.push(successor);
                }
            });
        }

        // Remaining input-edge counts, restricted to edges within the closure
        let mut remaining_inputs: HashMap<ProcessorNodeRef, usize> = HashMap::new();
        for &node in &reachable {
            let mut count = 0;
            self.for_each_predecessor(node, |predecessor| {
                if reachable.contains(&predecessor) {
                    count += 1;
                }
            });
            remaining_inputs.insert(node, count);
        }

        let mut ready: Vec<ProcessorNodeRef> = root_nodes
            .iter()
            .copied()
            .filter(|node| remaining_inputs[node] == 0)
            .collect();
        ready.dedup();

        while let Some(node) = ready.pop() {
            visit(node);
            self.for_each_successor(node, |successor| {
                let count = remaining_inputs
                    .get_mut(&successor)
                    .expect("successor is in the reachable closure");
                debug_assert!(*count > 0);
                *count -= 1;
                if *count == 0 {
                    ready.push(successor);
                }
            });
        }
    }

    /// The set of (A, B) pairs where B is forward-reachable from A, including
    /// (A, A) itself. Used to decide which tasks may run concurrently.
    pub fn graph_node_reachability(
        &self,
        root_nodes: &[ProcessorNodeRef],
    ) -> HashSet<(ProcessorNodeRef, ProcessorNodeRef)> {
        let mut reachable_pairs = HashSet::new();
        self.iterate_graph_topological(root_nodes, |node| {
            // DFS from each node; the graph is a DAG so this terminates
            let mut node_stack = vec![node];
            while let Some(current) = node_stack.pop() {
                if reachable_pairs.insert((node, current)) {
                    self.for_each_successor(current, |successor| node_stack.push(successor));
                }
            }
        });
        reachable_pairs
    }

    /// Resolves a GraphOutput node to its stage output index: its position in
    /// the voice-to-effect output list, else in the output-channel list.
    pub fn graph_output_index(&self, graph_output: ProcessorNodeRef) -> usize {
        if let Some(index) = self
            .voice_to_effect_outputs
            .iter()
            .position(|&node| node == graph_output)
        {
            return index;
        }
        self.output_channels
            .iter()
            .position(|&node| node == graph_output)
            .expect("graph output is a voice-to-effect output or an output channel")
    }

    /// Visits every native-module-call node directly consuming `output`,
    /// looking through array nodes. GraphOutput consumers are skipped; other
    /// consumer kinds cannot appear downstream of a processor output.
    pub fn for_each_connected_native_module_call(
        &self,
        output: OutputNodeRef,
        visit: &mut impl FnMut(ProcessorNodeRef),
    ) {
        for &input in self.output_node(output).connections() {
            let consumer = self.input_node(input).processor();
            match consumer {
                ProcessorNodeRef::Array(_) => {
                    self.for_each_connected_native_module_call(self.array_node(consumer).output, visit);
                }
                ProcessorNodeRef::NativeModuleCall(_) => visit(consumer),
                ProcessorNodeRef::GraphOutput(_) => {}
                _ => debug_assert!(false, "invalid consumer of a processor output"),
            }
        }
    }
}
