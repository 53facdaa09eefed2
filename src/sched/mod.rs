//! Preemptive round-robin scheduler and task lifecycle.
//!
//! Every live task sits on one circular ring threaded through `Task::next`.
//! The timer path and the voluntary yield path both funnel into
//! [`Scheduler::reschedule`], the only place state transitions happen.
//! Dead tasks stay on the ring until the next reschedule reaps them; they
//! are never torn down synchronously.

pub mod context;
pub mod task;

use crate::constants::memory::PAGE_SIZE;
use crate::constants::tasks::{TASK_STACK_SIZE, TIME_SLICE, USER_STACKS_START, USER_STACK_STRIDE};
use crate::critical::without_interrupts;
use crate::memory::{heap::KernelHeap, MemoryManager};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use context::{Context, ContextSwitch};
use core::ptr::NonNull;
use spin::Mutex;
use task::{Pid, Task, TaskEntry, TaskState};
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

struct SchedInner {
    tasks: BTreeMap<Pid, Box<Task>>,
    /// Some ring member, or None while the ring is empty.
    head: Option<Pid>,
    current: Option<Pid>,
    next_pid: Pid,
    enabled: bool,
}

/// The scheduler. Ring state lives behind one lock that is only ever taken
/// with interrupts disabled, because [`Scheduler::tick`] runs in interrupt
/// context. The raw context swap happens after the lock is released; no
/// lock is ever held across a switch.
pub struct Scheduler {
    memory: Arc<MemoryManager>,
    heap: &'static KernelHeap,
    port: Arc<dyn ContextSwitch>,
    inner: Mutex<SchedInner>,
}

/// First dispatch target for every task. Receives the real entry point, the
/// prepared user stack top (0 for kernel tasks), and the owning scheduler.
/// Kernel tasks run the entry here and a plain return funnels into the
/// common exit path; user tasks hand entry and stack to the platform's
/// privilege-drop primitive and leave through the exit syscall instead.
extern "C" fn task_trampoline(entry: u64, user_stack_top: u64, sched: u64) -> ! {
    let sched = unsafe { &*(sched as *const Scheduler) };
    if user_stack_top != 0 {
        unsafe { sched.port.enter_user(entry, user_stack_top) };
    }
    let entry: TaskEntry = unsafe { core::mem::transmute(entry as usize) };
    entry();
    sched.exit_current();
    unreachable!("dead task was scheduled again")
}

impl Scheduler {
    pub fn new(
        memory: Arc<MemoryManager>,
        heap: &'static KernelHeap,
        port: Arc<dyn ContextSwitch>,
    ) -> Scheduler {
        Scheduler {
            memory,
            heap,
            port,
            inner: Mutex::new(SchedInner {
                tasks: BTreeMap::new(),
                head: None,
                current: None,
                next_pid: 0,
                enabled: false,
            }),
        }
    }

    /// Enables preemption. A no-op until a first task exists to run.
    pub fn start(&self) {
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.current.is_some() && !inner.enabled {
                inner.enabled = true;
                log::info!("scheduler enabled");
            }
        })
    }

    pub fn current(&self) -> Option<Pid> {
        without_interrupts(|| self.inner.lock().current)
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        without_interrupts(|| self.inner.lock().tasks.get(&pid).map(|t| t.state))
    }

    /// Live tasks, dead-but-unreaped ones included.
    pub fn task_count(&self) -> usize {
        without_interrupts(|| self.inner.lock().tasks.len())
    }

    /// Creates a kernel task with a private kernel stack. The very first
    /// task created becomes the running one.
    pub fn spawn_kernel(&self, entry: TaskEntry, name: &str) -> Option<Pid> {
        self.spawn(entry, name, true)
    }

    /// Creates a user task: a kernel stack plus a private mapped user-stack
    /// window whose prepared stack top is handed to the trampoline.
    pub fn spawn_user(&self, entry: TaskEntry, name: &str) -> Option<Pid> {
        self.spawn(entry, name, false)
    }

    fn spawn(&self, entry: TaskEntry, name: &str, is_kernel: bool) -> Option<Pid> {
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            let pid = inner.next_pid;

            let stack = match self.heap.kmalloc(TASK_STACK_SIZE) {
                Some(p) => p,
                None => {
                    log::warn!("spawn {}: no heap for a kernel stack", name);
                    return None;
                }
            };
            unsafe { core::ptr::write_bytes(stack.as_ptr(), 0, TASK_STACK_SIZE) };

            let mut task = Task::new(pid, name, stack.as_ptr() as u64, is_kernel);

            // The scheduler lives behind an Arc for the kernel's lifetime,
            // so the trampoline can hold a raw pointer to it.
            let sched_ptr = self as *const Scheduler as u64;
            let trampoline = task_trampoline as usize as u64;
            let entry = entry as usize as u64;

            if is_kernel {
                task.context =
                    Context::prime(trampoline, entry, 0, sched_ptr, task.kernel_stack_top());
            } else {
                let user_base = USER_STACKS_START + pid * USER_STACK_STRIDE;
                if !self.map_user_stack(user_base, name) {
                    self.heap.kfree(stack);
                    return None;
                }
                task.user_stack = user_base;

                let mut user_top = user_base + TASK_STACK_SIZE as u64;
                user_top &= !0xF;
                user_top -= 8; // ABI alignment
                task.context = Context::prime(
                    trampoline,
                    entry,
                    user_top,
                    sched_ptr,
                    task.kernel_stack_top(),
                );
            }

            match inner.head {
                None => {
                    task.state = TaskState::Running;
                    task.next = pid;
                    inner.head = Some(pid);
                    inner.current = Some(pid);
                }
                Some(head) => {
                    // Append at the tail, right before head, so tasks run in
                    // creation order.
                    let mut tail = head;
                    while inner.tasks[&tail].next != head {
                        tail = inner.tasks[&tail].next;
                    }
                    task.next = head;
                    inner
                        .tasks
                        .get_mut(&tail)
                        .expect("ring tail missing from the task table")
                        .next = pid;
                }
            }

            log::info!(
                "created {} task {} (pid {})",
                if is_kernel { "kernel" } else { "user" },
                task.name,
                pid
            );
            inner.tasks.insert(pid, Box::new(task));
            inner.next_pid += 1;
            Some(pid)
        })
    }

    /// Maps a task's user-stack pages, unwinding every page already mapped
    /// if any allocation along the way fails.
    fn map_user_stack(&self, user_base: u64, name: &str) -> bool {
        let root = self.memory.kernel_pml4();
        let pages = TASK_STACK_SIZE.div_ceil(PAGE_SIZE as usize);
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        for i in 0..pages {
            let virt = VirtAddr::new(user_base + (i as u64) * PAGE_SIZE);
            let mapped = match self.memory.alloc_page() {
                Some(phys) => {
                    self.memory.map_page(root, virt, phys, flags);
                    // map_page gives up silently when a table allocation
                    // fails mid-walk, so verify the translation landed.
                    if self.memory.virt_to_phys(root, virt) == Some(phys) {
                        true
                    } else {
                        self.memory.free_page(phys);
                        false
                    }
                }
                None => false,
            };
            if !mapped {
                for j in 0..i {
                    let v = VirtAddr::new(user_base + (j as u64) * PAGE_SIZE);
                    if let Some(p) = self.memory.virt_to_phys(root, v) {
                        self.memory.free_page(p);
                    }
                    self.memory.unmap_page(root, v);
                }
                log::warn!("spawn {}: out of memory mapping the user stack", name);
                return false;
            }
        }
        true
    }

    /// Voluntary hand-off. Returns once this task is scheduled again.
    pub fn yield_now(&self) {
        self.reschedule();
    }

    /// Timer-driven path: burn one quantum tick and reschedule when the
    /// slice is spent. Called from the timer interrupt, so the context swap
    /// happens inside the handler and returns into a different task.
    pub fn tick(&self) {
        let expired = without_interrupts(|| {
            let mut inner = self.inner.lock();
            if !inner.enabled {
                return false;
            }
            let Some(cur) = inner.current else {
                return false;
            };
            let t = inner
                .tasks
                .get_mut(&cur)
                .expect("current task missing from the task table");
            if t.time_slice_remaining > 0 {
                t.time_slice_remaining -= 1;
            }
            t.time_slice_remaining == 0
        });
        if expired {
            self.reschedule();
        }
    }

    /// Marks the running task dead and hands off. The task's resources are
    /// reclaimed by whichever task reschedules next, never here.
    pub fn exit_current(&self) {
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            if let Some(cur) = inner.current {
                let t = inner
                    .tasks
                    .get_mut(&cur)
                    .expect("current task missing from the task table");
                t.state = TaskState::Dead;
                log::info!("task {} (pid {}) exited", t.name, cur);
            }
        });
        self.reschedule();
    }

    /// The single scheduling decision point: reap, pick the next runnable
    /// task, apply the state transitions, then swap contexts with the ring
    /// lock already released.
    fn reschedule(&self) {
        without_interrupts(|| {
            let pair = {
                let mut inner = self.inner.lock();
                if !inner.enabled {
                    return;
                }

                self.reap_dead(&mut inner);

                let Some(cur) = inner.current else {
                    return;
                };
                let next = Self::select_next(&inner, cur);
                if next == cur {
                    return;
                }

                {
                    let old = inner
                        .tasks
                        .get_mut(&cur)
                        .expect("current task missing from the task table");
                    if old.state == TaskState::Running {
                        old.state = TaskState::Ready;
                    }
                    old.time_slice_remaining = TIME_SLICE;
                }
                let (stack_top, next_ctx) = {
                    let new = inner
                        .tasks
                        .get_mut(&next)
                        .expect("selected task missing from the task table");
                    new.state = TaskState::Running;
                    new.time_slice_remaining = TIME_SLICE;
                    (new.kernel_stack_top(), NonNull::from(&mut new.context))
                };
                let prev_ctx = NonNull::from(
                    &mut inner
                        .tasks
                        .get_mut(&cur)
                        .expect("current task missing from the task table")
                        .context,
                );

                inner.current = Some(next);
                self.port.set_kernel_stack(stack_top);
                Some((prev_ctx, next_ctx))
            };

            if let Some((prev, next)) = pair {
                unsafe { self.port.switch(prev.as_ptr(), next.as_ptr()) };
            }
        })
    }

    /// Walks forward from the current task and returns the first Ready or
    /// Running one, falling back to the current task itself. Blocked and
    /// dead tasks are skipped.
    fn select_next(inner: &SchedInner, cur: Pid) -> Pid {
        let start = inner
            .tasks
            .get(&cur)
            .expect("current task missing from the task table")
            .next;
        let mut iter = start;
        loop {
            let t = &inner.tasks[&iter];
            if matches!(t.state, TaskState::Ready | TaskState::Running) {
                return iter;
            }
            iter = t.next;
            if iter == start {
                break;
            }
        }
        cur
    }

    /// Unlinks every dead task except the currently executing one and
    /// releases its kernel stack and user-stack pages. The lazy collection
    /// point for all task teardown.
    fn reap_dead(&self, inner: &mut SchedInner) {
        let Some(head) = inner.head else {
            return;
        };

        let mut dead = Vec::new();
        let mut iter = head;
        loop {
            let t = &inner.tasks[&iter];
            if t.state == TaskState::Dead && inner.current != Some(iter) {
                dead.push(iter);
            }
            iter = t.next;
            if iter == head {
                break;
            }
        }

        for pid in dead {
            self.release_task(inner, pid);
        }
    }

    fn release_task(&self, inner: &mut SchedInner, pid: Pid) {
        let next = inner.tasks[&pid].next;
        if next == pid {
            // Last ring member; the ring is now empty.
            inner.head = None;
        } else {
            let mut pred = next;
            loop {
                let pn = inner.tasks[&pred].next;
                if pn == pid {
                    break;
                }
                pred = pn;
            }
            inner
                .tasks
                .get_mut(&pred)
                .expect("ring predecessor missing from the task table")
                .next = next;
            if inner.head == Some(pid) {
                inner.head = Some(next);
            }
        }

        let task = inner
            .tasks
            .remove(&pid)
            .expect("reaped task missing from the task table");

        if let Some(stack) = NonNull::new(task.kernel_stack as *mut u8) {
            self.heap.kfree(stack);
        }
        if task.user_stack != 0 && !task.is_kernel_task {
            let root = self.memory.kernel_pml4();
            let pages = task.stack_size.div_ceil(PAGE_SIZE as usize);
            for i in 0..pages {
                let v = VirtAddr::new(task.user_stack + (i as u64) * PAGE_SIZE);
                if let Some(p) = self.memory.virt_to_phys(root, v) {
                    self.memory.free_page(p);
                    self.memory.unmap_page(root, v);
                }
            }
        }

        log::debug!("reaped task {} (pid {})", task.name, task.pid);
    }
}
