use std::collections::VecDeque;

use crate::{command::LowLevelCommand, error::ScheduleError, registry::Registry};

/// FIFO of pending atomic commands plus the set of commands awaiting their echo.
///
/// Dispatch is strictly in queue order. A head that is blocked by an active command stays
/// at the head, and nothing behind it may overtake it.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<LowLevelCommand>,
    active: Vec<LowLevelCommand>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Appends the commands of macro `name` to the queue, returning how many were added.
    pub fn enqueue_macro(&mut self, registry: &Registry, name: &str) -> Result<usize, ScheduleError> {
        let Some(high_level) = registry.macro_named(name) else {
            return Err(ScheduleError::UnknownMacro(name.to_string()));
        };
        self.queue.extend(high_level.commands.iter().cloned());
        log::debug!(
            "Queued {} commands of {}, {} pending",
            high_level.commands.len(),
            name,
            self.queue.len()
        );
        Ok(high_level.commands.len())
    }

    pub fn enqueue(&mut self, command: LowLevelCommand) {
        self.queue.push_back(command);
    }

    /// Whether the active set currently holds back `command`.
    pub fn is_blocked(&self, command: &LowLevelCommand) -> bool {
        self.active.iter().any(|active| active.blocks(command))
    }

    /// Pops the head of the queue and marks it active, unless an active command blocks it.
    pub fn try_dispatch(&mut self) -> Option<LowLevelCommand> {
        let head = self.queue.front()?;
        if self.is_blocked(head) {
            log::trace!("{} is blocked by an active command", head.name());
            return None;
        }
        let command = self.queue.pop_front()?;
        self.active.push(command.clone());
        Some(command)
    }

    /// Releases the first active command equal to `received`.
    ///
    /// Returns false if nothing matched.
    pub fn acknowledge(&mut self, received: &LowLevelCommand) -> bool {
        match self.active.iter().position(|active| active == received) {
            Some(index) => {
                self.active.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &LowLevelCommand> {
        self.queue.iter()
    }

    pub fn active(&self) -> &[LowLevelCommand] {
        &self.active
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }
}

#[cfg(test)]
mod test {
    use slowctl_protocol::Role;

    use super::*;
    use crate::command::{CommandDefinition, Priority};

    fn command(device: Role, name: &str, priority: Priority) -> LowLevelCommand {
        LowLevelCommand {
            definition: CommandDefinition::new(device, name, 0, 0, 0),
            priority,
            int_args: vec![],
            float_args: vec![],
            string_args: vec![],
        }
    }

    #[test]
    fn empty_queue_dispatches_nothing() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.try_dispatch(), None);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn global_lock_blocks_other_devices() {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue(command(Role::ControlNode, "reset", Priority::Global));
        let queued = command(Role::ModuleNode, "read_temperature", Priority::Free);
        scheduler.enqueue(queued.clone());

        assert!(scheduler.try_dispatch().is_some());
        assert_eq!(scheduler.try_dispatch(), None);
        assert_eq!(scheduler.try_dispatch(), None);
        assert_eq!(scheduler.pending().collect::<Vec<_>>(), vec![&queued]);
    }

    #[test]
    fn device_lock_only_blocks_same_device() {
        let mut scheduler = Scheduler::new();
        let lock = command(Role::ControlNode, "set_voltage", Priority::Device);
        scheduler.enqueue(lock.clone());
        scheduler.enqueue(command(Role::ModuleNode, "read_temperature", Priority::Free));
        scheduler.enqueue(command(Role::ControlNode, "read_voltage", Priority::Free));

        assert_eq!(scheduler.try_dispatch(), Some(lock.clone()));
        assert_eq!(
            scheduler.try_dispatch().map(|c| c.device()),
            Some(Role::ModuleNode)
        );
        assert_eq!(scheduler.try_dispatch(), None);

        assert!(scheduler.acknowledge(&lock));
        assert_eq!(
            scheduler.try_dispatch().map(|c| c.name().to_string()),
            Some("read_voltage".to_string())
        );
    }

    #[test]
    fn blocked_head_is_not_overtaken() {
        let mut scheduler = Scheduler::new();
        let first = command(Role::ControlNode, "set_voltage", Priority::Device);
        let second = command(Role::ControlNode, "read_voltage", Priority::Device);
        let third = command(Role::ModuleNode, "read_temperature", Priority::Free);
        scheduler.enqueue(first.clone());
        scheduler.enqueue(second.clone());
        scheduler.enqueue(third.clone());

        assert_eq!(scheduler.try_dispatch(), Some(first.clone()));
        // second is blocked by first; third must wait behind it although its device is free
        assert_eq!(scheduler.try_dispatch(), None);
        assert_eq!(scheduler.pending().count(), 2);

        scheduler.acknowledge(&first);
        assert_eq!(scheduler.try_dispatch(), Some(second));
        assert_eq!(scheduler.try_dispatch(), Some(third));
    }

    #[test]
    fn free_commands_never_block() {
        let mut scheduler = Scheduler::new();
        for _ in 0..3 {
            scheduler.enqueue(command(Role::ControlNode, "read_voltage", Priority::Free));
        }
        for _ in 0..3 {
            assert!(scheduler.try_dispatch().is_some());
        }
        assert_eq!(scheduler.active().len(), 3);
    }

    #[test]
    fn acknowledge_removes_one_of_identical() {
        let mut scheduler = Scheduler::new();
        let read = command(Role::ControlNode, "read_voltage", Priority::Free);
        scheduler.enqueue(read.clone());
        scheduler.enqueue(read.clone());
        scheduler.try_dispatch();
        scheduler.try_dispatch();
        assert_eq!(scheduler.active().len(), 2);

        assert!(scheduler.acknowledge(&read));
        assert_eq!(scheduler.active(), &[read.clone()]);
        assert!(scheduler.acknowledge(&read));
        assert!(!scheduler.acknowledge(&read));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn acknowledge_requires_equal_arguments() {
        let mut scheduler = Scheduler::new();
        let mut read = command(Role::ControlNode, "read_voltage", Priority::Free);
        read.int_args = vec![1];
        scheduler.enqueue(read.clone());
        scheduler.try_dispatch();

        let mut other = read.clone();
        other.int_args = vec![2];
        assert!(!scheduler.acknowledge(&other));
        assert_eq!(scheduler.active().len(), 1);
    }

    #[test]
    fn unknown_macro_changes_nothing() {
        let registry = Registry::default();
        let mut scheduler = Scheduler::new();
        assert_eq!(
            scheduler.enqueue_macro(&registry, "nope"),
            Err(ScheduleError::UnknownMacro("nope".to_string()))
        );
        assert!(scheduler.is_idle());
    }

    #[test]
    fn poll_voltage_scenario() {
        let registry = Registry::parse(
            "BEGIN DEFINITIONS\nPI read_voltage 0 0 0\nEND DEFINITIONS\n\
             BEGIN SEQUENCE\npoll_voltage\nPI read_voltage\nEND SEQUENCE\n",
        )
        .unwrap();
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.enqueue_macro(&registry, "poll_voltage"), Ok(1));

        let expected = &registry.macro_named("poll_voltage").unwrap().commands[0];
        let dispatched = scheduler.try_dispatch().unwrap();
        assert_eq!(&dispatched, expected);
        assert_eq!(scheduler.active(), std::slice::from_ref(expected));
        assert_eq!(scheduler.try_dispatch(), None);
    }
}
