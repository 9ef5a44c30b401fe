use hashbrown::HashMap;

use crate::backend::{
    BackendError, BackendKind, BufferDesc, CpuDescriptorHandle, Descriptor, DescriptorHeapId,
    DescriptorHeapKind, GpuBackend, MemoryHeap, PipelineDesc, PipelineId, PresentRequest,
    ResourceId, RootSignatureDesc, RootSignatureId, TextureDesc,
};
use crate::cmd::{CommandList, HostCmd};

/// When submitted fences are reported complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// A submission completes as soon as it is made.
    Immediate,
    /// Submissions stay pending until [`NullBackend::retire_through`] or a
    /// blocking wait reaches them. Lets tests drive a fake fence clock.
    Manual,
}

#[derive(Debug, Clone)]
pub struct NullSubmission {
    pub fence: u64,
    pub labels: Vec<&'static str>,
    pub cmds: Vec<HostCmd>,
}

#[derive(Debug, Default)]
struct NullHeap {
    kind: Option<DescriptorHeapKind>,
    slots: Vec<Option<Descriptor>>,
}

/// Headless backend: performs no rendering but keeps full bookkeeping of
/// object lifetimes, submissions and fence progress.
#[derive(Debug)]
pub struct NullBackend {
    mode: FenceMode,
    next_id: u64,
    buffers: HashMap<ResourceId, BufferDesc>,
    upload_contents: HashMap<ResourceId, Vec<u8>>,
    textures: HashMap<ResourceId, TextureDesc>,
    root_signatures: HashMap<RootSignatureId, RootSignatureDesc>,
    pipelines: HashMap<PipelineId, RootSignatureId>,
    heaps: Vec<NullHeap>,
    destroyed: Vec<ResourceId>,
    destroyed_pipelines: Vec<PipelineId>,
    submissions: Vec<NullSubmission>,
    submitted_fence: u64,
    completed_fence: u64,
    waits: Vec<u64>,
    presents: Vec<PresentRequest>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new(FenceMode::Immediate)
    }
}

impl NullBackend {
    pub fn new(mode: FenceMode) -> Self {
        Self {
            mode,
            next_id: 1,
            buffers: HashMap::new(),
            upload_contents: HashMap::new(),
            textures: HashMap::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            heaps: Vec::new(),
            destroyed: Vec::new(),
            destroyed_pipelines: Vec::new(),
            submissions: Vec::new(),
            submitted_fence: 0,
            completed_fence: 0,
            waits: Vec::new(),
            presents: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Marks every submission up to and including `fence` as finished.
    pub fn retire_through(&mut self, fence: u64) {
        self.completed_fence = self.completed_fence.max(fence.min(self.submitted_fence));
    }

    pub fn retire_all(&mut self) {
        self.completed_fence = self.submitted_fence;
    }

    pub fn submitted_fence(&self) -> u64 {
        self.submitted_fence
    }

    /// Submitted but not completed fences.
    pub fn frames_in_flight(&self) -> u64 {
        self.submitted_fence - self.completed_fence
    }

    pub fn submissions(&self) -> &[NullSubmission] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&NullSubmission> {
        self.submissions.last()
    }

    pub fn fence_waits(&self) -> &[u64] {
        &self.waits
    }

    pub fn presents(&self) -> &[PresentRequest] {
        &self.presents
    }

    pub fn destroyed_resources(&self) -> &[ResourceId] {
        &self.destroyed
    }

    pub fn destroyed_pipelines(&self) -> &[PipelineId] {
        &self.destroyed_pipelines
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        self.buffers.contains_key(&id) || self.textures.contains_key(&id)
    }

    pub fn buffer_desc(&self, id: ResourceId) -> Option<&BufferDesc> {
        self.buffers.get(&id)
    }

    pub fn texture_desc(&self, id: ResourceId) -> Option<&TextureDesc> {
        self.textures.get(&id)
    }

    pub fn upload_contents(&self, id: ResourceId) -> Option<&[u8]> {
        self.upload_contents.get(&id).map(Vec::as_slice)
    }

    pub fn root_signature_count(&self) -> usize {
        self.root_signatures.len()
    }

    pub fn root_signature_desc(&self, id: RootSignatureId) -> Option<&RootSignatureDesc> {
        self.root_signatures.get(&id)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn descriptor(&self, handle: CpuDescriptorHandle) -> Option<&Descriptor> {
        self.heaps
            .get(handle.heap.0 as usize)?
            .slots
            .get(handle.index as usize)?
            .as_ref()
    }
}

impl GpuBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, BackendError> {
        let id = ResourceId(self.alloc_id());
        if desc.heap == MemoryHeap::Upload {
            self.upload_contents.insert(id, vec![0; desc.size as usize]);
        }
        self.buffers.insert(id, *desc);
        Ok(id)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<ResourceId, BackendError> {
        let id = ResourceId(self.alloc_id());
        self.textures.insert(id, *desc);
        Ok(id)
    }

    fn destroy_resource(&mut self, id: ResourceId) {
        let removed = self.buffers.remove(&id).is_some() | self.textures.remove(&id).is_some();
        debug_assert!(removed, "destroying unknown resource {id:?}");
        self.upload_contents.remove(&id);
        self.destroyed.push(id);
    }

    fn write_buffer(
        &mut self,
        id: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let contents = self
            .upload_contents
            .get_mut(&id)
            .ok_or(BackendError::UnknownHandle {
                kind: "upload buffer",
                id: id.0,
            })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::OutOfMemory {
                what: "upload buffer write",
                size: end as u64,
            });
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeapId, BackendError> {
        let id = DescriptorHeapId(self.heaps.len() as u32);
        self.heaps.push(NullHeap {
            kind: Some(kind),
            slots: vec![None; capacity as usize],
        });
        Ok(id)
    }

    fn write_descriptor(&mut self, handle: CpuDescriptorHandle, descriptor: &Descriptor) {
        let heap = &mut self.heaps[handle.heap.0 as usize];
        debug_assert_eq!(
            heap.kind == Some(DescriptorHeapKind::Sampler),
            matches!(descriptor, Descriptor::Sampler(_)),
            "descriptor kind does not match heap kind"
        );
        heap.slots[handle.index as usize] = Some(*descriptor);
    }

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureId, BackendError> {
        let id = RootSignatureId(self.alloc_id());
        self.root_signatures.insert(id, desc.clone());
        Ok(id)
    }

    fn destroy_root_signature(&mut self, id: RootSignatureId) {
        self.root_signatures.remove(&id);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, BackendError> {
        if !self.root_signatures.contains_key(&desc.root_signature) {
            return Err(BackendError::UnknownHandle {
                kind: "root signature",
                id: desc.root_signature.0,
            });
        }
        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(id, desc.root_signature);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.pipelines.remove(&id);
        self.destroyed_pipelines.push(id);
    }

    fn submit(&mut self, lists: &[&CommandList], signal_fence: u64) -> Result<(), BackendError> {
        assert!(
            signal_fence > self.submitted_fence,
            "fence values must increase (got {signal_fence}, last {})",
            self.submitted_fence
        );
        self.submissions.push(NullSubmission {
            fence: signal_fence,
            labels: lists.iter().map(|l| l.label()).collect(),
            cmds: lists.iter().flat_map(|l| l.cmds().iter().cloned()).collect(),
        });
        self.submitted_fence = signal_fence;
        if self.mode == FenceMode::Immediate {
            self.completed_fence = signal_fence;
        }
        Ok(())
    }

    fn completed_fence(&mut self) -> u64 {
        self.completed_fence
    }

    fn wait_for_fence(&mut self, fence: u64) -> Result<(), BackendError> {
        if fence > self.submitted_fence {
            return Err(BackendError::DeviceLost(format!(
                "waiting for fence {fence} which was never submitted (last {})",
                self.submitted_fence
            )));
        }
        self.waits.push(fence);
        self.retire_through(fence);
        Ok(())
    }

    fn present(&mut self, request: &PresentRequest) -> Result<(), BackendError> {
        self.presents.push(*request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceState;

    fn upload_desc(size: u64) -> BufferDesc {
        BufferDesc {
            label: "test",
            size,
            heap: MemoryHeap::Upload,
            initial_state: ResourceState::GENERIC_READ,
            unordered_access: false,
        }
    }

    #[test]
    fn manual_fences_only_advance_when_retired() {
        let mut backend = NullBackend::new(FenceMode::Manual);
        let list = CommandList::new("draw");
        backend.submit(&[&list], 1).unwrap();
        backend.submit(&[&list], 2).unwrap();
        assert_eq!(backend.completed_fence(), 0);
        assert_eq!(backend.frames_in_flight(), 2);

        backend.retire_through(1);
        assert_eq!(backend.completed_fence(), 1);

        backend.wait_for_fence(2).unwrap();
        assert_eq!(backend.completed_fence(), 2);
        assert_eq!(backend.fence_waits(), &[2]);
    }

    #[test]
    fn waiting_for_unsubmitted_fence_fails() {
        let mut backend = NullBackend::default();
        assert!(backend.wait_for_fence(1).is_err());
    }

    #[test]
    fn upload_writes_are_visible() {
        let mut backend = NullBackend::default();
        let id = backend.create_buffer(&upload_desc(16)).unwrap();
        backend.write_buffer(id, 4, &[1, 2, 3]).unwrap();
        assert_eq!(&backend.upload_contents(id).unwrap()[4..7], &[1, 2, 3]);
        assert!(backend.write_buffer(id, 15, &[0, 0]).is_err());

        backend.destroy_resource(id);
        assert!(!backend.is_live(id));
        assert_eq!(backend.destroyed_resources(), &[id]);
    }
}
