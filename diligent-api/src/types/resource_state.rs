#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

use crate::{Buffer, Texture};

bitflags::bitflags! {
    /// Engine-level state of a resource. A resource whose state is `UNKNOWN` is tracked by the
    /// application, the engine never transitions it implicitly.
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct ResourceState: u32 {
        const UNKNOWN = 0;
        const UNDEFINED = 0x1;
        const VERTEX_BUFFER = 0x2;
        const CONSTANT_BUFFER = 0x4;
        const INDEX_BUFFER = 0x8;
        const RENDER_TARGET = 0x10;
        const UNORDERED_ACCESS = 0x20;
        const DEPTH_WRITE = 0x40;
        const DEPTH_READ = 0x80;
        const SHADER_RESOURCE = 0x100;
        const STREAM_OUT = 0x200;
        const INDIRECT_ARGUMENT = 0x400;
        const COPY_DEST = 0x800;
        const COPY_SOURCE = 0x1000;
        const RESOLVE_DEST = 0x2000;
        const RESOLVE_SOURCE = 0x4000;
        const INPUT_ATTACHMENT = 0x8000;
        const PRESENT = 0x10000;
        /// Union of the read-only states. Read-only states may be combined rather than transitioned.
        const GENERIC_READ = (0x2 | 0x4 | 0x8 | 0x100 | 0x400 | 0x1000);
    }
}

bitflags::bitflags! {
    /// Native (D3D12) resource states, the values recorded in barriers
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct NativeResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = (((((0x1 | 0x2) | 0x40) | 0x80) | 0x200) | 0x800);
        const PRESENT = 0;
    }
}

const RESOURCE_STATE_NAMES: [(ResourceState, &str); 17] = [
    (ResourceState::UNDEFINED, "UNDEFINED"),
    (ResourceState::VERTEX_BUFFER, "VERTEX_BUFFER"),
    (ResourceState::CONSTANT_BUFFER, "CONSTANT_BUFFER"),
    (ResourceState::INDEX_BUFFER, "INDEX_BUFFER"),
    (ResourceState::RENDER_TARGET, "RENDER_TARGET"),
    (ResourceState::UNORDERED_ACCESS, "UNORDERED_ACCESS"),
    (ResourceState::DEPTH_WRITE, "DEPTH_WRITE"),
    (ResourceState::DEPTH_READ, "DEPTH_READ"),
    (ResourceState::SHADER_RESOURCE, "SHADER_RESOURCE"),
    (ResourceState::STREAM_OUT, "STREAM_OUT"),
    (ResourceState::INDIRECT_ARGUMENT, "INDIRECT_ARGUMENT"),
    (ResourceState::COPY_DEST, "COPY_DEST"),
    (ResourceState::COPY_SOURCE, "COPY_SOURCE"),
    (ResourceState::RESOLVE_DEST, "RESOLVE_DEST"),
    (ResourceState::RESOLVE_SOURCE, "RESOLVE_SOURCE"),
    (ResourceState::INPUT_ATTACHMENT, "INPUT_ATTACHMENT"),
    (ResourceState::PRESENT, "PRESENT"),
];

impl ResourceState {
    pub fn is_known(self) -> bool {
        self != ResourceState::UNKNOWN
    }

    /// Human-readable form used in diagnostics, e.g. `RESOURCE_STATE_COPY_DEST|RESOURCE_STATE_SHADER_RESOURCE`
    pub fn name(self) -> String {
        if self == ResourceState::UNKNOWN {
            return "RESOURCE_STATE_UNKNOWN".to_string();
        }

        let mut name = String::new();
        for (state, state_name) in RESOURCE_STATE_NAMES.iter() {
            if self.contains(*state) {
                if !name.is_empty() {
                    name.push('|');
                }
                name.push_str("RESOURCE_STATE_");
                name.push_str(state_name);
            }
        }
        name
    }
}

impl From<ResourceState> for NativeResourceStates {
    fn from(state: ResourceState) -> Self {
        let mut native_states = NativeResourceStates::COMMON;
        for bit in 0..32 {
            let state_bit = match ResourceState::from_bits(1 << bit) {
                Some(state_bit) if state.contains(state_bit) => state_bit,
                _ => continue,
            };

            native_states |= match state_bit {
                ResourceState::UNDEFINED => NativeResourceStates::COMMON,
                ResourceState::VERTEX_BUFFER | ResourceState::CONSTANT_BUFFER => {
                    NativeResourceStates::VERTEX_AND_CONSTANT_BUFFER
                }
                ResourceState::INDEX_BUFFER => NativeResourceStates::INDEX_BUFFER,
                ResourceState::RENDER_TARGET => NativeResourceStates::RENDER_TARGET,
                ResourceState::UNORDERED_ACCESS => NativeResourceStates::UNORDERED_ACCESS,
                ResourceState::DEPTH_WRITE => NativeResourceStates::DEPTH_WRITE,
                ResourceState::DEPTH_READ => NativeResourceStates::DEPTH_READ,
                ResourceState::SHADER_RESOURCE => {
                    NativeResourceStates::NON_PIXEL_SHADER_RESOURCE
                        | NativeResourceStates::PIXEL_SHADER_RESOURCE
                }
                ResourceState::STREAM_OUT => NativeResourceStates::STREAM_OUT,
                ResourceState::INDIRECT_ARGUMENT => NativeResourceStates::INDIRECT_ARGUMENT,
                ResourceState::COPY_DEST => NativeResourceStates::COPY_DEST,
                ResourceState::COPY_SOURCE => NativeResourceStates::COPY_SOURCE,
                ResourceState::RESOLVE_DEST => NativeResourceStates::RESOLVE_DEST,
                ResourceState::RESOLVE_SOURCE => NativeResourceStates::RESOLVE_SOURCE,
                ResourceState::INPUT_ATTACHMENT => NativeResourceStates::PIXEL_SHADER_RESOURCE,
                ResourceState::PRESENT => NativeResourceStates::PRESENT,
                _ => NativeResourceStates::COMMON,
            };
        }
        native_states
    }
}

/// How a transition is recorded. Split barriers let the GPU start a transition early (`Begin`) and
/// wait for it later (`End`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum StateTransitionType {
    Immediate,
    Begin,
    End,
}

impl Default for StateTransitionType {
    fn default() -> Self {
        StateTransitionType::Immediate
    }
}

pub const REMAINING_MIP_LEVELS: u32 = u32::MAX;
pub const REMAINING_ARRAY_SLICES: u32 = u32::MAX;

#[derive(Copy, Clone)]
pub enum StateTransitionResource<'a> {
    Texture(&'a Texture),
    Buffer(&'a Buffer),
}

/// A request to move a resource (or part of a texture) into `new_state`
#[derive(Copy, Clone)]
pub struct StateTransitionDesc<'a> {
    pub resource: StateTransitionResource<'a>,
    pub first_mip_level: u32,
    pub mip_levels_count: u32,
    pub first_array_slice: u32,
    pub array_slice_count: u32,
    /// Overrides the tracked state. Required when the tracked state is `UNKNOWN`.
    pub old_state: ResourceState,
    pub new_state: ResourceState,
    pub transition_type: StateTransitionType,
    /// Record `new_state` as the resource's tracked state
    pub update_resource_state: bool,
}

impl<'a> StateTransitionDesc<'a> {
    pub fn texture(
        texture: &'a Texture,
        old_state: ResourceState,
        new_state: ResourceState,
        update_resource_state: bool,
    ) -> Self {
        StateTransitionDesc {
            resource: StateTransitionResource::Texture(texture),
            first_mip_level: 0,
            mip_levels_count: REMAINING_MIP_LEVELS,
            first_array_slice: 0,
            array_slice_count: REMAINING_ARRAY_SLICES,
            old_state,
            new_state,
            transition_type: StateTransitionType::Immediate,
            update_resource_state,
        }
    }

    pub fn buffer(
        buffer: &'a Buffer,
        old_state: ResourceState,
        new_state: ResourceState,
        update_resource_state: bool,
    ) -> Self {
        StateTransitionDesc {
            resource: StateTransitionResource::Buffer(buffer),
            first_mip_level: 0,
            mip_levels_count: REMAINING_MIP_LEVELS,
            first_array_slice: 0,
            array_slice_count: REMAINING_ARRAY_SLICES,
            old_state,
            new_state,
            transition_type: StateTransitionType::Immediate,
            update_resource_state,
        }
    }

    pub fn with_subresources(
        mut self,
        first_mip_level: u32,
        mip_levels_count: u32,
        first_array_slice: u32,
        array_slice_count: u32,
    ) -> Self {
        self.first_mip_level = first_mip_level;
        self.mip_levels_count = mip_levels_count;
        self.first_array_slice = first_array_slice;
        self.array_slice_count = array_slice_count;
        self
    }

    pub fn with_transition_type(
        mut self,
        transition_type: StateTransitionType,
    ) -> Self {
        self.transition_type = transition_type;
        self
    }
}
