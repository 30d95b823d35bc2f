// Copyright (c) 2024 The vkcompute developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A HAL implementation that executes everything on the CPU.
//!
//! Kernels are Rust closures registered by name with [`HostHal::register_kernel`]. Each
//! submission runs on its own background thread, which plays the role of the device timeline: it
//! waits for the submission's semaphores, executes the operations of the command buffer in order,
//! then signals the submission's semaphores and fences.
//!
//! # Binary format
//!
//! An executable binary is UTF-8 text with one kernel per line. A line is either a kernel name,
//! or a kernel name followed by `@X,Y,Z`, which marks the kernel as specialized for the local size
//! `[X, Y, Z]`. Launching a specialized kernel with a different local size is rejected.
//! [`HostCompiler`] produces binaries in this format.
//!
//! # Memory
//!
//! If the HAL is created with non-coherent memory, writes through a mapping land in a shadow
//! copy that is only made visible to kernels by a flush, and reads through a mapping only see
//! device writes after an invalidate.

use super::{
    BufferCopy, Hal, HalError, KernelArg, MemoryProperties, NdRange, RawBuffer, RawCommandBuffer,
    RawExecutable, RawFence, RawKernel, RawMemory, RawSemaphore, SubmitBatch, UserCallback,
};
use crate::{
    shader::{CompileError, KernelCompiler, NdRangeOptions, ShaderModule},
    DeviceSize,
};
use foldhash::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    mem,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// The signature of a kernel registered with a [`HostHal`].
pub type HostKernelFn = Arc<dyn Fn(&KernelInvocation<'_>) + Send + Sync>;

/// Parameters to create a [`HostHal`].
#[derive(Clone, Debug)]
pub struct HostHalCreateInfo {
    /// Whether mapped memory is host-coherent.
    ///
    /// The default value is `true`.
    pub host_coherent: bool,

    /// If set, this many memory allocations succeed, after which every allocation fails with
    /// [`HalError::OutOfDeviceMemory`].
    ///
    /// The default value is `None`.
    pub fail_allocations_after: Option<u32>,

    pub _ne: crate::NonExhaustive,
}

impl Default for HostHalCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            host_coherent: true,
            fail_allocations_after: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

/// A HAL that runs on the CPU.
pub struct HostHal {
    host_coherent: bool,
    next_handle: AtomicU64,
    kernels: RwLock<HashMap<String, HostKernelFn>>,
    objects: Mutex<Objects>,
    allocation_budget: Mutex<Option<u32>>,
    object_budget: Mutex<Option<u32>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    device_lost: AtomicBool,
}

#[derive(Default)]
struct Objects {
    command_buffers: HashMap<NonZeroU64, Arc<Mutex<Vec<Op>>>>,
    fences: HashMap<NonZeroU64, Arc<Signal>>,
    semaphores: HashMap<NonZeroU64, Arc<Signal>>,
    executables: HashMap<NonZeroU64, Arc<Executable>>,
    kernels: HashMap<NonZeroU64, Arc<Kernel>>,
    memories: HashMap<NonZeroU64, Arc<Memory>>,
    buffers: HashMap<NonZeroU64, Buffer>,
}

impl Objects {
    fn len(&self) -> usize {
        self.command_buffers.len()
            + self.fences.len()
            + self.semaphores.len()
            + self.executables.len()
            + self.kernels.len()
            + self.memories.len()
            + self.buffers.len()
    }
}

impl HostHal {
    /// Creates a new `HostHal` with no registered kernels.
    pub fn new(create_info: HostHalCreateInfo) -> Self {
        let HostHalCreateInfo {
            host_coherent,
            fail_allocations_after,
            _ne: _,
        } = create_info;

        HostHal {
            host_coherent,
            next_handle: AtomicU64::new(1),
            kernels: RwLock::new(HashMap::default()),
            objects: Mutex::new(Objects::default()),
            allocation_budget: Mutex::new(fail_allocations_after),
            object_budget: Mutex::new(None),
            in_flight: Mutex::new(Vec::new()),
            device_lost: AtomicBool::new(false),
        }
    }

    /// Registers a kernel under `name`. Executables that name the kernel resolve to `function`.
    ///
    /// The function is called once per launch, and is responsible for iterating over the work
    /// items of the launch, for example with [`KernelInvocation::global_ids`].
    pub fn register_kernel(
        &self,
        name: impl Into<String>,
        function: impl Fn(&KernelInvocation<'_>) + Send + Sync + 'static,
    ) {
        self.kernels.write().insert(name.into(), Arc::new(function));
    }

    /// Changes how many more memory allocations succeed. `None` removes the limit.
    pub fn set_allocation_budget(&self, budget: Option<u32>) {
        *self.allocation_budget.lock() = budget;
    }

    /// Changes how many more command buffers, fences and semaphores can be created before
    /// creation fails with [`HalError::OutOfHostMemory`]. `None` removes the limit.
    pub fn set_object_budget(&self, budget: Option<u32>) {
        *self.object_budget.lock() = budget;
    }

    /// Returns the number of HAL objects that currently exist.
    pub fn live_object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn next_handle(&self) -> NonZeroU64 {
        NonZeroU64::new(self.next_handle.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
            eprintln!("the host HAL handle counter has overflown ...somehow");
            std::process::abort();
        })
    }

    // A kernel that panicked takes its submission down with it.
    fn join(&self, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            self.device_lost.store(true, Ordering::Release);
        }
    }

    fn charge_allocation(&self) -> Result<(), HalError> {
        charge(&self.allocation_budget, HalError::OutOfDeviceMemory)
    }

    fn charge_object(&self) -> Result<(), HalError> {
        charge(&self.object_budget, HalError::OutOfHostMemory)
    }

    fn memory(&self, memory: RawMemory) -> Result<Arc<Memory>, HalError> {
        self.objects
            .lock()
            .memories
            .get(&memory.as_raw())
            .cloned()
            .ok_or(HalError::InvalidArgument("unknown memory handle"))
    }

    fn ops(&self, command_buffer: RawCommandBuffer) -> Result<Arc<Mutex<Vec<Op>>>, HalError> {
        self.objects
            .lock()
            .command_buffers
            .get(&command_buffer.as_raw())
            .cloned()
            .ok_or(HalError::InvalidArgument("unknown command buffer handle"))
    }

    fn fence(&self, fence: RawFence) -> Result<Arc<Signal>, HalError> {
        self.objects
            .lock()
            .fences
            .get(&fence.as_raw())
            .cloned()
            .ok_or(HalError::InvalidArgument("unknown fence handle"))
    }

    fn bound_range(
        objects: &Objects,
        buffer: RawBuffer,
        offset: DeviceSize,
        range: DeviceSize,
    ) -> Result<MemoryRange, HalError> {
        let buffer = objects
            .buffers
            .get(&buffer.as_raw())
            .ok_or(HalError::InvalidArgument("unknown buffer handle"))?;
        let (memory, memory_offset) = buffer
            .binding
            .clone()
            .ok_or(HalError::InvalidArgument("buffer has no memory bound"))?;

        if offset.checked_add(range).map_or(true, |end| end > buffer.size) {
            return Err(HalError::InvalidArgument("range is out of the bounds of the buffer"));
        }

        Ok(MemoryRange {
            memory,
            offset: memory_offset + offset,
            size: range,
        })
    }
}

impl Debug for HostHal {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("HostHal")
            .field("host_coherent", &self.host_coherent)
            .field("live_objects", &self.live_object_count())
            .finish_non_exhaustive()
    }
}

fn charge(budget: &Mutex<Option<u32>>, err: HalError) -> Result<(), HalError> {
    match budget.lock().as_mut() {
        Some(0) => Err(err),
        Some(remaining) => {
            *remaining -= 1;
            Ok(())
        }
        None => Ok(()),
    }
}

impl Hal for HostHal {
    fn memory_properties(&self) -> MemoryProperties {
        MemoryProperties {
            host_coherent: self.host_coherent,
        }
    }

    fn create_command_buffer(&self) -> Result<RawCommandBuffer, HalError> {
        self.charge_object()?;
        let handle = self.next_handle();
        self.objects
            .lock()
            .command_buffers
            .insert(handle, Arc::new(Mutex::new(Vec::new())));

        Ok(RawCommandBuffer::from_raw(handle))
    }

    fn reset_command_buffer(&self, command_buffer: RawCommandBuffer) -> Result<(), HalError> {
        self.ops(command_buffer)?.lock().clear();

        Ok(())
    }

    fn destroy_command_buffer(&self, command_buffer: RawCommandBuffer) {
        self.objects
            .lock()
            .command_buffers
            .remove(&command_buffer.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<RawFence, HalError> {
        self.charge_object()?;
        let handle = self.next_handle();
        self.objects
            .lock()
            .fences
            .insert(handle, Arc::new(Signal::new(signaled)));

        Ok(RawFence::from_raw(handle))
    }

    fn fence_status(&self, fence: RawFence) -> Result<bool, HalError> {
        Ok(self.fence(fence)?.is_signaled())
    }

    fn wait_fence(&self, fence: RawFence, timeout: Option<Duration>) -> Result<bool, HalError> {
        Ok(self.fence(fence)?.wait(timeout))
    }

    fn reset_fence(&self, fence: RawFence) -> Result<(), HalError> {
        self.fence(fence)?.reset();

        Ok(())
    }

    fn destroy_fence(&self, fence: RawFence) {
        self.objects.lock().fences.remove(&fence.as_raw());
    }

    fn create_semaphore(&self) -> Result<RawSemaphore, HalError> {
        self.charge_object()?;
        let handle = self.next_handle();
        self.objects
            .lock()
            .semaphores
            .insert(handle, Arc::new(Signal::new(false)));

        Ok(RawSemaphore::from_raw(handle))
    }

    fn reset_semaphore(&self, semaphore: RawSemaphore) -> Result<(), HalError> {
        self.objects
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .ok_or(HalError::InvalidArgument("unknown semaphore handle"))?
            .reset();

        Ok(())
    }

    fn destroy_semaphore(&self, semaphore: RawSemaphore) {
        self.objects.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn create_executable(&self, binary: &[u8]) -> Result<RawExecutable, HalError> {
        let executable = Executable::parse(binary)?;
        let handle = self.next_handle();
        self.objects
            .lock()
            .executables
            .insert(handle, Arc::new(executable));

        Ok(RawExecutable::from_raw(handle))
    }

    fn destroy_executable(&self, executable: RawExecutable) {
        self.objects.lock().executables.remove(&executable.as_raw());
    }

    fn create_kernel(&self, executable: RawExecutable, name: &str) -> Result<RawKernel, HalError> {
        let entry = self
            .objects
            .lock()
            .executables
            .get(&executable.as_raw())
            .ok_or(HalError::InvalidArgument("unknown executable handle"))?
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
            .ok_or_else(|| HalError::KernelNotFound(name.to_owned()))?;
        let function = self
            .kernels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HalError::KernelNotFound(name.to_owned()))?;

        let handle = self.next_handle();
        self.objects.lock().kernels.insert(
            handle,
            Arc::new(Kernel {
                name: entry.name,
                local_size: entry.local_size,
                function,
            }),
        );

        Ok(RawKernel::from_raw(handle))
    }

    fn destroy_kernel(&self, kernel: RawKernel) {
        self.objects.lock().kernels.remove(&kernel.as_raw());
    }

    fn allocate_memory(&self, size: DeviceSize) -> Result<RawMemory, HalError> {
        self.charge_allocation()?;

        let len = usize::try_from(size).map_err(|_| HalError::OutOfDeviceMemory)?;
        let handle = self.next_handle();
        self.objects.lock().memories.insert(
            handle,
            Arc::new(Memory {
                size,
                device: Mutex::new(vec![0; len]),
                mapping: Mutex::new(None),
            }),
        );

        Ok(RawMemory::from_raw(handle))
    }

    fn free_memory(&self, memory: RawMemory) {
        self.objects.lock().memories.remove(&memory.as_raw());
    }

    fn create_buffer(&self, size: DeviceSize) -> Result<RawBuffer, HalError> {
        let handle = self.next_handle();
        self.objects.lock().buffers.insert(
            handle,
            Buffer {
                size,
                binding: None,
            },
        );

        Ok(RawBuffer::from_raw(handle))
    }

    fn bind_buffer_memory(
        &self,
        buffer: RawBuffer,
        memory: RawMemory,
        offset: DeviceSize,
    ) -> Result<(), HalError> {
        let mut objects = self.objects.lock();
        let memory = objects
            .memories
            .get(&memory.as_raw())
            .cloned()
            .ok_or(HalError::InvalidArgument("unknown memory handle"))?;
        let buffer = objects
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(HalError::InvalidArgument("unknown buffer handle"))?;

        if buffer.binding.is_some() {
            return Err(HalError::InvalidArgument("buffer already has memory bound"));
        }

        if offset + buffer.size > memory.size {
            return Err(HalError::InvalidArgument("memory is too small for the buffer"));
        }

        buffer.binding = Some((memory, offset));

        Ok(())
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.objects.lock().buffers.remove(&buffer.as_raw());
    }

    fn map_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError> {
        let memory = self.memory(memory)?;

        if offset.checked_add(size).map_or(true, |end| end > memory.size) {
            return Err(HalError::MemoryMapFailed);
        }

        let mut mapping = memory.mapping.lock();

        if mapping.is_some() {
            return Err(HalError::MemoryMapFailed);
        }

        // Non-coherent mappings start out as a snapshot of the device contents.
        let shadow = (!self.host_coherent).then(|| memory.device.lock().clone());
        *mapping = Some(Mapping {
            offset,
            size,
            shadow,
        });

        Ok(())
    }

    fn write_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), HalError> {
        let memory = self.memory(memory)?;
        let mut mapping = memory.mapping.lock();
        let mapping = mapping
            .as_mut()
            .ok_or(HalError::InvalidArgument("memory is not mapped"))?;
        let range = mapping.checked_range(offset, data.len() as DeviceSize)?;

        match &mut mapping.shadow {
            Some(shadow) => shadow[range].copy_from_slice(data),
            None => memory.device.lock()[range].copy_from_slice(data),
        }

        Ok(())
    }

    fn read_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        data: &mut [u8],
    ) -> Result<(), HalError> {
        let memory = self.memory(memory)?;
        let mapping = memory.mapping.lock();
        let mapping = mapping
            .as_ref()
            .ok_or(HalError::InvalidArgument("memory is not mapped"))?;
        let range = mapping.checked_range(offset, data.len() as DeviceSize)?;

        match &mapping.shadow {
            Some(shadow) => data.copy_from_slice(&shadow[range]),
            None => data.copy_from_slice(&memory.device.lock()[range]),
        }

        Ok(())
    }

    fn flush_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError> {
        let memory = self.memory(memory)?;
        let mapping = memory.mapping.lock();
        let mapping = mapping
            .as_ref()
            .ok_or(HalError::InvalidArgument("memory is not mapped"))?;
        let range = mapping.checked_range(offset, size)?;

        if let Some(shadow) = &mapping.shadow {
            memory.device.lock()[range.clone()].copy_from_slice(&shadow[range]);
        }

        Ok(())
    }

    fn invalidate_mapped_memory(
        &self,
        memory: RawMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), HalError> {
        let memory = self.memory(memory)?;
        let mut mapping = memory.mapping.lock();
        let mapping = mapping
            .as_mut()
            .ok_or(HalError::InvalidArgument("memory is not mapped"))?;
        let range = mapping.checked_range(offset, size)?;

        if let Some(shadow) = &mut mapping.shadow {
            shadow[range.clone()].copy_from_slice(&memory.device.lock()[range]);
        }

        Ok(())
    }

    fn unmap_memory(&self, memory: RawMemory) {
        if let Ok(memory) = self.memory(memory) {
            *memory.mapping.lock() = None;
        }
    }

    fn enqueue_ndrange(
        &self,
        command_buffer: RawCommandBuffer,
        kernel: RawKernel,
        ndrange: &NdRange,
        args: &[KernelArg],
    ) -> Result<(), HalError> {
        let op = {
            let objects = self.objects.lock();
            let kernel = objects
                .kernels
                .get(&kernel.as_raw())
                .cloned()
                .ok_or(HalError::InvalidArgument("unknown kernel handle"))?;

            if kernel
                .local_size
                .is_some_and(|local_size| local_size != ndrange.local_size)
            {
                return Err(HalError::InvalidArgument(
                    "kernel was specialized for a different local size",
                ));
            }

            let args = args
                .iter()
                .map(|&arg| {
                    let (buffer, offset, range, kind) = match arg {
                        KernelArg::Buffer {
                            buffer,
                            offset,
                            range,
                        } => (buffer, offset, range, HostArgKind::Buffer),
                        KernelArg::PushConstants { buffer, size } => {
                            (buffer, 0, size, HostArgKind::PushConstants)
                        }
                        KernelArg::BufferSizes { buffer, count } => (
                            buffer,
                            0,
                            DeviceSize::from(count) * 4,
                            HostArgKind::BufferSizes,
                        ),
                    };

                    Ok(HostArg {
                        range: Self::bound_range(&objects, buffer, offset, range)?,
                        kind,
                    })
                })
                .collect::<Result<Vec<_>, HalError>>()?;

            Op::NdRange {
                kernel,
                ndrange: *ndrange,
                args,
            }
        };

        self.ops(command_buffer)?.lock().push(op);

        Ok(())
    }

    fn enqueue_copy_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        src_buffer: RawBuffer,
        dst_buffer: RawBuffer,
        regions: &[BufferCopy],
    ) -> Result<(), HalError> {
        let op = {
            let objects = self.objects.lock();
            let regions = regions
                .iter()
                .map(|region| {
                    Ok((
                        Self::bound_range(&objects, src_buffer, region.src_offset, region.size)?,
                        Self::bound_range(&objects, dst_buffer, region.dst_offset, region.size)?,
                    ))
                })
                .collect::<Result<SmallVec<_>, HalError>>()?;

            Op::Copy { regions }
        };

        self.ops(command_buffer)?.lock().push(op);

        Ok(())
    }

    fn enqueue_fill_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        dst_buffer: RawBuffer,
        offset: DeviceSize,
        size: DeviceSize,
        data: u32,
    ) -> Result<(), HalError> {
        let dst = Self::bound_range(&self.objects.lock(), dst_buffer, offset, size)?;
        self.ops(command_buffer)?
            .lock()
            .push(Op::Fill { dst, data });

        Ok(())
    }

    fn enqueue_write_buffer(
        &self,
        command_buffer: RawCommandBuffer,
        dst_buffer: RawBuffer,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), HalError> {
        let dst = Self::bound_range(
            &self.objects.lock(),
            dst_buffer,
            offset,
            data.len() as DeviceSize,
        )?;
        self.ops(command_buffer)?.lock().push(Op::Write {
            dst,
            data: data.into(),
        });

        Ok(())
    }

    fn enqueue_user_callback(
        &self,
        command_buffer: RawCommandBuffer,
        callback: UserCallback,
    ) -> Result<(), HalError> {
        self.ops(command_buffer)?
            .lock()
            .push(Op::Callback(callback));

        Ok(())
    }

    fn submit(&self, batch: &SubmitBatch<'_>) -> Result<(), HalError> {
        let &SubmitBatch {
            command_buffer,
            wait_semaphores,
            signal_semaphores,
            signal_fences,
        } = batch;

        let (ops, waits, signals) = {
            let objects = self.objects.lock();
            let ops = objects
                .command_buffers
                .get(&command_buffer.as_raw())
                .ok_or(HalError::InvalidArgument("unknown command buffer handle"))?
                .lock()
                .clone();
            let semaphore = |raw: RawSemaphore| {
                objects
                    .semaphores
                    .get(&raw.as_raw())
                    .cloned()
                    .ok_or(HalError::InvalidArgument("unknown semaphore handle"))
            };
            let waits = wait_semaphores
                .iter()
                .map(|&(raw, _stages)| semaphore(raw))
                .collect::<Result<SmallVec<[_; 4]>, _>>()?;
            // Fences are signaled before semaphores, in the order given. A submission waiting on
            // one of the semaphores then never observes an earlier fence as unsignaled.
            let mut signals = signal_fences
                .iter()
                .map(|&raw| {
                    objects
                        .fences
                        .get(&raw.as_raw())
                        .cloned()
                        .ok_or(HalError::InvalidArgument("unknown fence handle"))
                })
                .collect::<Result<SmallVec<[_; 4]>, _>>()?;

            for &raw in signal_semaphores {
                signals.push(semaphore(raw)?);
            }

            (ops, waits, signals)
        };

        let handle = thread::Builder::new()
            .name("vkcompute-host-queue".into())
            .spawn(move || {
                for wait in &waits {
                    wait.wait_and_consume();
                }

                for op in &ops {
                    op.execute();
                }

                for signal in &signals {
                    signal.signal();
                }
            })
            .map_err(|_| HalError::OutOfHostMemory)?;

        let mut in_flight = self.in_flight.lock();
        let (finished, running) = mem::take(&mut *in_flight)
            .into_iter()
            .partition::<Vec<_>, _>(JoinHandle::is_finished);
        *in_flight = running;
        in_flight.push(handle);
        drop(in_flight);

        for handle in finished {
            self.join(handle);
        }

        Ok(())
    }

    fn wait_idle(&self) -> Result<(), HalError> {
        let handles = mem::take(&mut *self.in_flight.lock());

        for handle in handles {
            self.join(handle);
        }

        if self.device_lost.swap(false, Ordering::AcqRel) {
            Err(HalError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

/// A binary signal, used for both fences and semaphores.
struct Signal {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new(signaled: bool) -> Self {
        Signal {
            signaled: Mutex::new(signaled),
            condvar: Condvar::new(),
        }
    }

    fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    fn signal(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        *self.signaled.lock() = false;
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut signaled = self.signaled.lock();

        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                        return *signaled;
                    }
                }
                None => self.condvar.wait(&mut signaled),
            }
        }

        true
    }

    fn wait_and_consume(&self) {
        let mut signaled = self.signaled.lock();

        while !*signaled {
            self.condvar.wait(&mut signaled);
        }

        *signaled = false;
    }
}

#[derive(Clone, Debug)]
struct ExecutableEntry {
    name: String,
    local_size: Option<[u32; 3]>,
}

struct Executable {
    entries: Vec<ExecutableEntry>,
}

impl Executable {
    fn parse(binary: &[u8]) -> Result<Self, HalError> {
        let text = std::str::from_utf8(binary).map_err(|_| HalError::InvalidBinary)?;
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once('@') {
                None => Ok(ExecutableEntry {
                    name: line.to_owned(),
                    local_size: None,
                }),
                Some((name, dims)) => {
                    let mut local_size = [0u32; 3];
                    let mut parts = dims.split(',');

                    for dim in &mut local_size {
                        *dim = parts
                            .next()
                            .and_then(|part| part.trim().parse().ok())
                            .ok_or(HalError::InvalidBinary)?;
                    }

                    if parts.next().is_some() {
                        return Err(HalError::InvalidBinary);
                    }

                    Ok(ExecutableEntry {
                        name: name.to_owned(),
                        local_size: Some(local_size),
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        if entries.is_empty() {
            return Err(HalError::InvalidBinary);
        }

        Ok(Executable { entries })
    }
}

struct Kernel {
    name: String,
    local_size: Option<[u32; 3]>,
    function: HostKernelFn,
}

struct Memory {
    size: DeviceSize,
    device: Mutex<Vec<u8>>,
    mapping: Mutex<Option<Mapping>>,
}

struct Mapping {
    offset: DeviceSize,
    size: DeviceSize,
    shadow: Option<Vec<u8>>,
}

impl Mapping {
    fn checked_range(
        &self,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<std::ops::Range<usize>, HalError> {
        let end = offset
            .checked_add(size)
            .filter(|&end| offset >= self.offset && end <= self.offset + self.size)
            .ok_or(HalError::InvalidArgument("range is outside of the mapped range"))?;

        Ok(offset as usize..end as usize)
    }
}

struct Buffer {
    size: DeviceSize,
    binding: Option<(Arc<Memory>, DeviceSize)>,
}

/// A byte range of a memory allocation, resolved when an operation is enqueued.
#[derive(Clone)]
struct MemoryRange {
    memory: Arc<Memory>,
    offset: DeviceSize,
    size: DeviceSize,
}

impl MemoryRange {
    fn read(&self, offset: DeviceSize, data: &mut [u8]) {
        let device = self.memory.device.lock();
        let len = data.len() as DeviceSize;

        // Out-of-bounds reads return zeros, like robust buffer access.
        match self.resolve(offset, len) {
            Some(range) => data.copy_from_slice(&device[range]),
            None => data.fill(0),
        }
    }

    fn write(&self, offset: DeviceSize, data: &[u8]) {
        let mut device = self.memory.device.lock();

        // Out-of-bounds writes are discarded.
        if let Some(range) = self.resolve(offset, data.len() as DeviceSize) {
            device[range].copy_from_slice(data);
        }
    }

    fn resolve(&self, offset: DeviceSize, len: DeviceSize) -> Option<std::ops::Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size)?;

        Some((self.offset + offset) as usize..(self.offset + end) as usize)
    }
}

#[derive(Clone)]
enum Op {
    NdRange {
        kernel: Arc<Kernel>,
        ndrange: NdRange,
        args: Vec<HostArg>,
    },
    Copy {
        regions: SmallVec<[(MemoryRange, MemoryRange); 1]>,
    },
    Fill {
        dst: MemoryRange,
        data: u32,
    },
    Write {
        dst: MemoryRange,
        data: Arc<[u8]>,
    },
    Callback(UserCallback),
}

impl Op {
    fn execute(&self) {
        match self {
            Op::NdRange {
                kernel,
                ndrange,
                args,
            } => {
                log::trace!("host queue: launching `{}` over {:?}", kernel.name, ndrange);
                (kernel.function)(&KernelInvocation {
                    ndrange: *ndrange,
                    args,
                });
            }
            Op::Copy { regions } => {
                for (src, dst) in regions {
                    let mut data = vec![0; src.size as usize];
                    src.read(0, &mut data);
                    dst.write(0, &data);
                }
            }
            Op::Fill { dst, data } => {
                let pattern = data.to_le_bytes();
                let bytes: Vec<u8> = pattern
                    .iter()
                    .copied()
                    .cycle()
                    .take(dst.size as usize)
                    .collect();
                dst.write(0, &bytes);
            }
            Op::Write { dst, data } => dst.write(0, data),
            Op::Callback(callback) => callback(),
        }
    }
}

/// What a kernel argument was bound as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostArgKind {
    Buffer,
    PushConstants,
    BufferSizes,
}

/// A kernel argument as seen by a host kernel.
#[derive(Clone)]
pub struct HostArg {
    range: MemoryRange,
    kind: HostArgKind,
}

impl HostArg {
    #[inline]
    pub fn kind(&self) -> HostArgKind {
        self.kind
    }

    /// Returns the size in bytes of the bound range.
    #[inline]
    pub fn len(&self) -> DeviceSize {
        self.range.size
    }

    /// Reads bytes at `offset` within the bound range. Out-of-bounds reads return zeros.
    #[inline]
    pub fn read(&self, offset: DeviceSize, data: &mut [u8]) {
        self.range.read(offset, data);
    }

    /// Writes bytes at `offset` within the bound range. Out-of-bounds writes are discarded.
    #[inline]
    pub fn write(&self, offset: DeviceSize, data: &[u8]) {
        self.range.write(offset, data);
    }

    /// Reads the `index`th `u32` of the bound range.
    pub fn read_u32(&self, index: usize) -> u32 {
        let mut bytes = [0; 4];
        self.read(index as DeviceSize * 4, &mut bytes);

        u32::from_le_bytes(bytes)
    }

    /// Writes the `index`th `u32` of the bound range.
    pub fn write_u32(&self, index: usize, value: u32) {
        self.write(index as DeviceSize * 4, &value.to_le_bytes());
    }
}

/// The arguments of one kernel launch on a [`HostHal`].
pub struct KernelInvocation<'a> {
    ndrange: NdRange,
    args: &'a [HostArg],
}

impl KernelInvocation<'_> {
    #[inline]
    pub fn ndrange(&self) -> &NdRange {
        &self.ndrange
    }

    /// Returns the arguments in the order they were passed to the launch.
    #[inline]
    pub fn args(&self) -> &[HostArg] {
        self.args
    }

    /// Returns the `index`th argument.
    ///
    /// # Panics
    ///
    /// - Panics if there are not more than `index` arguments.
    #[inline]
    pub fn arg(&self, index: usize) -> &HostArg {
        &self.args[index]
    }

    /// Returns the first argument of the given kind, if any.
    pub fn arg_of_kind(&self, kind: HostArgKind) -> Option<&HostArg> {
        self.args.iter().find(|arg| arg.kind == kind)
    }

    /// Returns an iterator over the global IDs of all work items of the launch.
    pub fn global_ids(&self) -> impl Iterator<Item = [u32; 3]> {
        let NdRange {
            global_offset: [ox, oy, oz],
            global_size: [sx, sy, sz],
            ..
        } = self.ndrange;

        (oz..oz + sz).flat_map(move |z| {
            (oy..oy + sy).flat_map(move |y| (ox..ox + sx).map(move |x| [x, y, z]))
        })
    }
}

/// A [`KernelCompiler`] producing binaries for a [`HostHal`].
///
/// The code of a shader module is interpreted as the list of entry point names it contains, one
/// per line.
#[derive(Debug, Default)]
pub struct HostCompiler {
    rejected: Mutex<HashSet<String>>,
}

impl HostCompiler {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes specializing `entry_point` fail from now on.
    pub fn reject_entry_point(&self, entry_point: impl Into<String>) {
        self.rejected.lock().insert(entry_point.into());
    }
}

impl KernelCompiler for HostCompiler {
    fn create_specialized_kernel(
        &self,
        module: &ShaderModule,
        entry_point: &str,
        options: &NdRangeOptions,
    ) -> Result<Vec<u8>, CompileError> {
        let declared = std::str::from_utf8(module.code())
            .map_err(|_| CompileError::InvalidModule)?
            .lines()
            .any(|line| line.trim() == entry_point);

        if !declared {
            return Err(CompileError::EntryPointNotFound(entry_point.to_owned()));
        }

        if self.rejected.lock().contains(entry_point) {
            return Err(CompileError::Finalize(format!(
                "entry point `{}` was rejected",
                entry_point,
            )));
        }

        let [x, y, z] = options.local_size;

        Ok(format!("{}@{},{},{}", entry_point, x, y, z).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::{HostHal, HostHalCreateInfo};
    use crate::hal::{
        BufferCopy, Hal, HalBuffer, HalCommandBuffer, HalError, HalFence, HalKernel,
        HalSemaphore, KernelArg, NdRange, SubmitBatch,
    };
    use std::{sync::Arc, time::Duration};

    fn host(host_coherent: bool) -> (Arc<HostHal>, Arc<dyn Hal>) {
        let host = Arc::new(HostHal::new(HostHalCreateInfo {
            host_coherent,
            ..Default::default()
        }));
        let hal: Arc<dyn Hal> = host.clone();

        (host, hal)
    }

    fn submit(hal: &Arc<dyn Hal>, command_buffer: &HalCommandBuffer) -> HalFence {
        let fence = HalFence::new(hal, false).unwrap();
        hal.submit(&SubmitBatch {
            command_buffer: command_buffer.raw(),
            wait_semaphores: &[],
            signal_semaphores: &[],
            signal_fences: &[fence.raw()],
        })
        .unwrap();

        fence
    }

    #[test]
    fn executes_operations_in_order() {
        let (host, hal) = host(true);
        host.register_kernel("double", |inv| {
            let data = inv.arg(0);

            for [x, ..] in inv.global_ids() {
                data.write_u32(x as usize, data.read_u32(x as usize) * 2);
            }
        });

        let a = HalBuffer::new(&hal, 16).unwrap();
        let b = HalBuffer::new(&hal, 16).unwrap();
        let kernel = HalKernel::from_binary(&hal, b"double", "double").unwrap();
        let cb = HalCommandBuffer::new(&hal).unwrap();

        hal.enqueue_fill_buffer(cb.raw(), a.raw(), 0, 16, 3).unwrap();
        hal.enqueue_ndrange(
            cb.raw(),
            kernel.raw(),
            &NdRange {
                global_offset: [0; 3],
                global_size: [4, 1, 1],
                local_size: [1, 1, 1],
            },
            &[KernelArg::Buffer {
                buffer: a.raw(),
                offset: 0,
                range: 16,
            }],
        )
        .unwrap();
        hal.enqueue_copy_buffer(
            cb.raw(),
            a.raw(),
            b.raw(),
            &[BufferCopy {
                src_offset: 4,
                dst_offset: 0,
                size: 8,
            }],
        )
        .unwrap();

        assert!(submit(&hal, &cb).wait(Some(Duration::from_secs(5))).unwrap());

        let mut out = [0u8; 8];
        b.memory().download(0, &mut out).unwrap();
        assert_eq!(bytemuck::cast::<_, [u32; 2]>(out), [6, 6]);
    }

    #[test]
    fn semaphores_order_submissions() {
        let (_host, hal) = host(true);
        let buffer = HalBuffer::new(&hal, 4).unwrap();
        let first = HalCommandBuffer::new(&hal).unwrap();
        let second = HalCommandBuffer::new(&hal).unwrap();
        let semaphore = HalSemaphore::new(&hal).unwrap();
        let fence = HalFence::new(&hal, false).unwrap();

        hal.enqueue_write_buffer(first.raw(), buffer.raw(), 0, &7u32.to_le_bytes())
            .unwrap();
        hal.enqueue_user_callback(
            second.raw(),
            Arc::new(|| std::thread::sleep(Duration::from_millis(1))),
        )
        .unwrap();
        hal.enqueue_fill_buffer(second.raw(), buffer.raw(), 0, 4, 9).unwrap();

        // Submit the waiting side first; it must not overtake the signaling side.
        hal.submit(&SubmitBatch {
            command_buffer: second.raw(),
            wait_semaphores: &[(semaphore.raw(), Default::default())],
            signal_semaphores: &[],
            signal_fences: &[fence.raw()],
        })
        .unwrap();
        hal.submit(&SubmitBatch {
            command_buffer: first.raw(),
            wait_semaphores: &[],
            signal_semaphores: &[semaphore.raw()],
            signal_fences: &[],
        })
        .unwrap();

        assert!(fence.wait(Some(Duration::from_secs(5))).unwrap());

        let mut out = [0u8; 4];
        buffer.memory().download(0, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 9);
        hal.wait_idle().unwrap();
    }

    #[test]
    fn finished_submissions_are_pruned() {
        let (host, hal) = host(true);
        host.register_kernel("boom", |_| panic!("kernel failure"));
        let empty = HalCommandBuffer::new(&hal).unwrap();

        for _ in 0..8 {
            assert!(submit(&hal, &empty).wait(Some(Duration::from_secs(5))).unwrap());
        }

        let kernel = HalKernel::from_binary(&hal, b"boom", "boom").unwrap();
        let failing = HalCommandBuffer::new(&hal).unwrap();
        hal.enqueue_ndrange(
            failing.raw(),
            kernel.raw(),
            &NdRange {
                global_offset: [0; 3],
                global_size: [1, 1, 1],
                local_size: [1, 1, 1],
            },
            &[],
        )
        .unwrap();
        let _fence = submit(&hal, &failing);
        std::thread::sleep(Duration::from_millis(100));

        let _fence = submit(&hal, &empty);
        assert_eq!(host.in_flight.lock().len(), 1);

        // The failure is still reported after its thread was pruned.
        assert_eq!(hal.wait_idle(), Err(HalError::DeviceLost));
        assert!(host.in_flight.lock().is_empty());
        assert_eq!(hal.wait_idle(), Ok(()));
    }

    #[test]
    fn non_coherent_writes_need_flush() {
        let (_host, hal) = host(false);
        let buffer = HalBuffer::new(&hal, 4).unwrap();
        let memory = buffer.memory().raw();

        hal.map_memory(memory, 0, 4).unwrap();
        hal.write_mapped_memory(memory, 0, &[1, 2, 3, 4]).unwrap();
        hal.unmap_memory(memory);

        let mut out = [0u8; 4];
        buffer.memory().download(0, &mut out).unwrap();
        assert_eq!(out, [0; 4]);

        buffer.memory().upload(0, &[1, 2, 3, 4]).unwrap();
        buffer.memory().download(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn specialized_kernel_rejects_other_local_size() {
        let (host, hal) = host(true);
        host.register_kernel("k", |_| {});
        let kernel = HalKernel::from_binary(&hal, b"k@4,1,1", "k").unwrap();
        let cb = HalCommandBuffer::new(&hal).unwrap();

        let result = hal.enqueue_ndrange(
            cb.raw(),
            kernel.raw(),
            &NdRange {
                global_offset: [0; 3],
                global_size: [8, 1, 1],
                local_size: [2, 1, 1],
            },
            &[],
        );
        assert!(matches!(result, Err(HalError::InvalidArgument(_))));
    }

    #[test]
    fn allocation_budget() {
        let host = Arc::new(HostHal::new(HostHalCreateInfo {
            fail_allocations_after: Some(1),
            ..Default::default()
        }));
        let hal: Arc<dyn Hal> = host.clone();

        assert!(HalBuffer::new(&hal, 4).is_ok());
        assert_eq!(HalBuffer::new(&hal, 4).unwrap_err(), HalError::OutOfDeviceMemory);

        host.set_allocation_budget(None);
        assert!(HalBuffer::new(&hal, 4).is_ok());

        host.set_object_budget(Some(1));
        assert!(HalFence::new(&hal, false).is_ok());
        assert_eq!(HalSemaphore::new(&hal).unwrap_err(), HalError::OutOfHostMemory);
        assert!(HalBuffer::new(&hal, 4).is_ok());
    }

    #[test]
    fn invalid_binaries() {
        let (host, hal) = host(true);
        host.register_kernel("k", |_| {});

        assert_eq!(hal.create_executable(b"").unwrap_err(), HalError::InvalidBinary);
        assert_eq!(hal.create_executable(b"k@1,2").unwrap_err(), HalError::InvalidBinary);
        assert_eq!(
            HalKernel::from_binary(&hal, b"k", "missing").unwrap_err(),
            HalError::KernelNotFound("missing".into()),
        );
    }
}
