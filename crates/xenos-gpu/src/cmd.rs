//! Backend-agnostic host command stream.
//!
//! The command processor is the only writer. Backends lower the stream onto
//! their API when a frame is submitted.

use serde::Serialize;

use crate::backend::{
    DescriptorHeapId, GpuDescriptorHandle, PipelineId, ResourceId, ResourceState,
    RootSignatureId, TextureFormat,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ScissorRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum HostCmd {
    SetPipeline(PipelineId),
    SetGraphicsRootSignature(RootSignatureId),
    SetDescriptorHeaps {
        view: DescriptorHeapId,
        sampler: DescriptorHeapId,
    },
    SetGraphicsRootDescriptorTable {
        parameter: u32,
        base: GpuDescriptorHandle,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetBlendFactor([f32; 4]),
    SetStencilRef(u32),
    SetPrimitiveTopology(PrimitiveTopology),
    SetRenderTargets {
        colors: [Option<ResourceId>; 4],
        depth: Option<ResourceId>,
    },
    SetIndexBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u64,
        format: IndexFormat,
    },
    ResourceBarrier {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders UAV writes before subsequent reads of the same resource.
    UavBarrier(ResourceId),
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: ResourceId,
        src_offset: u64,
        row_pitch: u32,
        dst: ResourceId,
        format: TextureFormat,
        width: u32,
        height: u32,
    },
    CopyTextureToBuffer {
        src: ResourceId,
        dst: ResourceId,
        dst_offset: u64,
        row_pitch: u32,
        format: TextureFormat,
        width: u32,
        height: u32,
    },
    /// Compute pass converting guest tiled texel order to linear.
    Untile {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        bytes_per_block: u32,
        width_blocks: u32,
        height_blocks: u32,
        pitch_blocks: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

/// One recorded host command list.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CommandList {
    label: &'static str,
    cmds: Vec<HostCmd>,
}

impl CommandList {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            cmds: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn push(&mut self, cmd: HostCmd) {
        self.cmds.push(cmd);
    }

    pub fn cmds(&self) -> &[HostCmd] {
        &self.cmds
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// Drops recorded commands, keeping the allocation.
    pub fn reset(&mut self) {
        self.cmds.clear();
    }
}
