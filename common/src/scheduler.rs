use serde::Serialize;

/// Timer table entries. Declaration order is dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskId {
    PumpDataUpdate,
    NtpSync,
    TimeUpdate,
    RestoreBrightness,
}

impl TaskId {
    pub const ALL: [TaskId; 4] = [
        Self::PumpDataUpdate,
        Self::NtpSync,
        Self::TimeUpdate,
        Self::RestoreBrightness,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireMode {
    /// Sets a due flag for the main loop to pick up.
    Deferred,
    /// Handed straight back to the caller of `tick`.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTask {
    pub id: TaskId,
    pub period_ms: u64,
    pub one_shot: bool,
    pub mode: FireMode,
}

impl TimerTask {
    pub fn periodic(id: TaskId, period_ms: u64) -> Self {
        Self {
            id,
            period_ms,
            one_shot: false,
            mode: FireMode::Deferred,
        }
    }

    pub fn one_shot(id: TaskId, period_ms: u64) -> Self {
        Self {
            id,
            period_ms,
            one_shot: true,
            mode: FireMode::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    task: TimerTask,
    enabled: bool,
    next_due_ms: u64,
    due: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    slots: [Option<Slot>; 4],
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a task. Registered tasks stay disabled until
    /// `start`.
    pub fn register(&mut self, task: TimerTask) {
        self.slots[task.id.index()] = Some(Slot {
            task,
            enabled: false,
            next_due_ms: 0,
            due: false,
        });
    }

    pub fn start(&mut self, id: TaskId, now_ms: u64) -> bool {
        match self.slots[id.index()].as_mut() {
            Some(slot) => {
                slot.enabled = true;
                slot.next_due_ms = now_ms.saturating_add(slot.task.period_ms);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, id: TaskId) {
        if let Some(slot) = self.slots[id.index()].as_mut() {
            slot.enabled = false;
            slot.due = false;
        }
    }

    pub fn trigger(&mut self, id: TaskId) {
        if let Some(slot) = self.slots[id.index()].as_mut() {
            slot.due = true;
        }
    }

    pub fn is_enabled(&self, id: TaskId) -> bool {
        self.slots[id.index()].is_some_and(|slot| slot.enabled)
    }

    pub fn is_due(&self, id: TaskId) -> bool {
        self.slots[id.index()].is_some_and(|slot| slot.due)
    }

    pub fn next_due_ms(&self, id: TaskId) -> Option<u64> {
        self.slots[id.index()]
            .filter(|slot| slot.enabled)
            .map(|slot| slot.next_due_ms)
    }

    /// Fires every enabled task whose deadline has passed and returns the
    /// immediate ones. A periodic task that fell behind fires once and is
    /// re-armed from `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<TaskId> {
        let mut immediate = Vec::new();

        for slot in self.slots.iter_mut().flatten() {
            if !slot.enabled || now_ms < slot.next_due_ms {
                continue;
            }

            match slot.task.mode {
                FireMode::Deferred => slot.due = true,
                FireMode::Immediate => immediate.push(slot.task.id),
            }

            if slot.task.one_shot {
                slot.enabled = false;
                continue;
            }

            let period = slot.task.period_ms.max(1);
            slot.next_due_ms = slot.next_due_ms.saturating_add(period);
            if slot.next_due_ms <= now_ms {
                slot.next_due_ms = now_ms.saturating_add(period);
            }
        }

        immediate
    }

    /// Returns the due deferred tasks in priority order and clears their
    /// flags.
    pub fn take_due(&mut self) -> Vec<TaskId> {
        self.slots
            .iter_mut()
            .flatten()
            .filter(|slot| slot.due)
            .map(|slot| {
                slot.due = false;
                slot.task.id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn scheduler() -> Scheduler {
        let mut scheduler = Scheduler::new();
        scheduler.register(TimerTask::periodic(TaskId::TimeUpdate, 10_000));
        scheduler.register(TimerTask::periodic(TaskId::NtpSync, 1_200_000));
        scheduler.register(TimerTask::periodic(TaskId::PumpDataUpdate, 60_000));
        scheduler.register(TimerTask::one_shot(TaskId::RestoreBrightness, 10_000));
        for id in [TaskId::TimeUpdate, TaskId::NtpSync, TaskId::PumpDataUpdate] {
            scheduler.start(id, 0);
        }
        scheduler
    }

    #[test]
    fn due_tasks_come_out_in_priority_order() {
        let mut scheduler = scheduler();
        scheduler.trigger(TaskId::TimeUpdate);
        scheduler.trigger(TaskId::NtpSync);
        scheduler.trigger(TaskId::PumpDataUpdate);

        assert_eq!(
            scheduler.take_due(),
            vec![TaskId::PumpDataUpdate, TaskId::NtpSync, TaskId::TimeUpdate]
        );
        assert!(scheduler.take_due().is_empty());
    }

    #[test]
    fn periodic_tasks_rearm_without_bursting() {
        let mut scheduler = scheduler();

        assert!(scheduler.tick(9_999).is_empty());
        assert!(scheduler.take_due().is_empty());

        scheduler.tick(10_000);
        assert_eq!(scheduler.take_due(), vec![TaskId::TimeUpdate]);
        assert_eq!(scheduler.next_due_ms(TaskId::TimeUpdate), Some(20_000));

        // Stalled for several periods: fires once, then re-arms from now.
        scheduler.tick(65_000);
        assert_eq!(
            scheduler.take_due(),
            vec![TaskId::PumpDataUpdate, TaskId::TimeUpdate]
        );
        assert_eq!(scheduler.next_due_ms(TaskId::TimeUpdate), Some(75_000));
    }

    #[test]
    fn one_shot_fires_once_and_immediately() {
        let mut scheduler = scheduler();
        scheduler.start(TaskId::RestoreBrightness, 1_000);

        assert!(scheduler.tick(10_999).is_empty());
        assert_eq!(scheduler.tick(11_000), vec![TaskId::RestoreBrightness]);
        assert!(!scheduler.is_enabled(TaskId::RestoreBrightness));
        assert!(scheduler.tick(21_000).is_empty());
        assert!(!scheduler.is_due(TaskId::RestoreBrightness));
    }

    #[test]
    fn cancelled_tasks_never_fire() {
        let mut scheduler = scheduler();
        scheduler.trigger(TaskId::NtpSync);
        scheduler.cancel(TaskId::NtpSync);

        scheduler.tick(2_400_000);

        assert!(!scheduler.take_due().contains(&TaskId::NtpSync));
        assert_eq!(scheduler.next_due_ms(TaskId::NtpSync), None);
    }

    #[test]
    fn unregistered_tasks_cannot_start() {
        let mut scheduler = Scheduler::new();
        assert!(!scheduler.start(TaskId::PumpDataUpdate, 0));
        assert!(scheduler.tick(1_000_000).is_empty());
    }
}
