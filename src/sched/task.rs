use crate::constants::tasks::{TASK_NAME_LEN, TASK_STACK_SIZE, TIME_SLICE};
use crate::sched::context::Context;
use arrayvec::ArrayString;

pub type Pid = u64;

/// Entry point for a schedulable task. A task that returns falls into the
/// common exit path.
pub type TaskEntry = extern "C" fn();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Reserved for I/O waits; nothing in this core enters it, but the
    /// scheduler already skips it.
    Blocked,
    Dead,
}

/// One schedulable task. Lives in the scheduler's task table and on the
/// circular ready ring via `next`.
pub struct Task {
    pub pid: Pid,
    pub name: ArrayString<TASK_NAME_LEN>,
    pub state: TaskState,
    pub context: Context,
    /// Base of the kmalloc-backed kernel stack.
    pub kernel_stack: u64,
    /// Base of the mapped user-stack region, 0 for kernel tasks.
    pub user_stack: u64,
    pub stack_size: usize,
    pub time_slice_remaining: u64,
    pub is_kernel_task: bool,
    /// Ring successor. A lone task points at itself.
    pub next: Pid,
}

impl Task {
    pub fn new(pid: Pid, name: &str, kernel_stack: u64, is_kernel_task: bool) -> Task {
        let mut task_name = ArrayString::new();
        for c in name.chars() {
            if task_name.try_push(c).is_err() {
                break;
            }
        }
        Task {
            pid,
            name: task_name,
            state: TaskState::Ready,
            context: Context::default(),
            kernel_stack,
            user_stack: 0,
            stack_size: TASK_STACK_SIZE,
            time_slice_remaining: TIME_SLICE,
            is_kernel_task,
            next: pid,
        }
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack + self.stack_size as u64
    }
}
