// Per frame-in-flight command and sync tools
//
// Two frame slots cycle; each owns its own pools, command buffers,
// fences and semaphores so recording frame N+1 never touches anything
// frame N still has in flight.

use ash::vk;

use crate::device::Device;
use crate::handles;
use crate::Result;

pub const FRAMES_IN_FLIGHT: usize = 2;

pub struct FrameTools {
    pub main_pool: handles::CommandPool,
    pub main_cbuf: vk::CommandBuffer,

    pub transfer_pool: handles::CommandPool,
    pub transfer_cbuf: vk::CommandBuffer,

    /// Only the cluster path records on the compute queue
    pub compute_pool: Option<handles::CommandPool>,
    pub compute_cbuf: vk::CommandBuffer,

    /// Signaled when this slot's graphics submission retires
    pub in_flight_fence: handles::Fence,

    /// Swapchain image acquisition -> graphics submission
    pub image_acquired: handles::Semaphore,
    /// Transfer submission -> first consumer of the transform copy
    pub buffers_ready: handles::Semaphore,
    /// Graphics submission -> present
    pub ready_to_present: handles::Semaphore,

    /// Cluster path only: the CPU waits here between the compute and
    /// graphics submissions to read back the cluster counts
    pub pre_cluster_fence: Option<handles::Fence>,
    /// Cluster path only: compute submission -> graphics submission
    pub pre_cluster_done: Option<handles::Semaphore>,
}

impl FrameTools {
    pub fn new(device: &Device, enable_clusters: bool) -> Result<Self> {
        let main_pool = handles::CommandPool::new(device.graphics_queue.family)?;
        let main_cbuf = main_pool.allocate(1)?[0];

        let transfer_pool = handles::CommandPool::new(device.transfer_queue.family)?;
        let transfer_cbuf = transfer_pool.allocate(1)?[0];

        let (compute_pool, compute_cbuf) = if enable_clusters {
            let pool = handles::CommandPool::new(device.compute_queue.family)?;
            let cbuf = pool.allocate(1)?[0];
            (Some(pool), cbuf)
        } else {
            (None, vk::CommandBuffer::null())
        };

        Ok(Self {
            main_pool,
            main_cbuf,
            transfer_pool,
            transfer_cbuf,
            compute_pool,
            compute_cbuf,
            // Signaled so the very first wait on this slot passes
            in_flight_fence: handles::Fence::new(true)?,
            image_acquired: handles::Semaphore::new()?,
            buffers_ready: handles::Semaphore::new()?,
            ready_to_present: handles::Semaphore::new()?,
            pre_cluster_fence: if enable_clusters {
                Some(handles::Fence::new(false)?)
            } else {
                None
            },
            pre_cluster_done: if enable_clusters {
                Some(handles::Semaphore::new()?)
            } else {
                None
            },
        })
    }
}
