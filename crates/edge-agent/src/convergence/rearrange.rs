use std::collections::HashMap;

use common::api::{Application, Snapshot, Task};
use tracing::warn;

use super::model::LabelPolicy;

/// Reorders tasks of port-range applications so that a task keeps the
/// listening port it had in `previous`.
///
/// Other applications, and applications absent from `previous`, are returned
/// as delivered.
pub fn rearrange(previous: Option<&Snapshot>, next: &Snapshot, policy: &LabelPolicy) -> Snapshot {
    next.apps()
        .map(|app| {
            let prior = previous.and_then(|snapshot| snapshot.get(&app.name));
            match prior {
                Some(prior) if policy.is_port_range(app) => Application {
                    tasks: stable_order(&app.name, &prior.tasks, &app.tasks),
                    ..app.clone()
                },
                _ => app.clone(),
            }
        })
        .collect()
}

/// Retained tasks keep their previous slot while it is still in range; the
/// remaining tasks fill empty slots in delivery order.
fn stable_order(app: &str, previous: &[Task], next: &[Task]) -> Vec<Task> {
    let positions: HashMap<&str, usize> = previous
        .iter()
        .enumerate()
        .map(|(idx, task)| (task.id.as_str(), idx))
        .collect();

    let mut slots: Vec<Option<Task>> = vec![None; next.len()];
    let mut unplaced = Vec::new();
    for task in next {
        match positions.get(task.id.as_str()) {
            Some(&idx) if idx < slots.len() && slots[idx].is_none() => {
                slots[idx] = Some(task.clone());
            }
            _ => unplaced.push(task.clone()),
        }
    }

    let mut unplaced = unplaced.into_iter();
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        *slot = unplaced.next();
    }

    let arranged: Vec<Task> = slots.into_iter().flatten().collect();
    if arranged.len() != next.len() || unplaced.next().is_some() {
        warn!(
            app,
            expected = next.len(),
            arranged = arranged.len(),
            "task rearrangement mismatch, using delivered order"
        );
        return next.to_vec();
    }
    arranged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app, task};

    fn ranged(tasks: Vec<Task>) -> Snapshot {
        let mut app = app("ranged", &[7000], tasks);
        app.labels
            .insert("relay.haproxy.port_range".into(), "true".into());
        std::iter::once(app).collect()
    }

    fn ids(snapshot: &Snapshot) -> Vec<String> {
        snapshot
            .get("ranged")
            .expect("app")
            .tasks
            .iter()
            .map(|task| task.id.clone())
            .collect()
    }

    #[test]
    fn retained_tasks_keep_their_slots() {
        let previous = ranged(vec![
            task("T1", "h1", &[1]),
            task("T2", "h2", &[2]),
            task("T3", "h3", &[3]),
        ]);
        let next = ranged(vec![
            task("T3", "h3", &[3]),
            task("T4", "h4", &[4]),
            task("T1", "h1", &[1]),
        ]);

        let arranged = rearrange(Some(&previous), &next, &LabelPolicy::default());
        assert_eq!(ids(&arranged), vec!["T1", "T4", "T3"]);
    }

    #[test]
    fn shrinking_moves_out_of_range_tasks_into_free_slots() {
        let previous = ranged(vec![
            task("T1", "h1", &[1]),
            task("T2", "h2", &[2]),
            task("T3", "h3", &[3]),
        ]);
        let next = ranged(vec![task("T3", "h3", &[3]), task("T1", "h1", &[1])]);

        let arranged = rearrange(Some(&previous), &next, &LabelPolicy::default());
        assert_eq!(ids(&arranged), vec!["T1", "T3"]);
    }

    #[test]
    fn without_previous_state_order_is_untouched() {
        let next = ranged(vec![task("T2", "h2", &[2]), task("T1", "h1", &[1])]);
        let arranged = rearrange(None, &next, &LabelPolicy::default());
        assert_eq!(arranged, next);
    }

    #[test]
    fn duplicate_ids_still_fill_every_slot() {
        let previous = ranged(vec![task("T1", "h1", &[1]), task("T2", "h2", &[2])]);
        let next = ranged(vec![
            task("T2", "h2", &[2]),
            task("T2", "h9", &[9]),
            task("T1", "h1", &[1]),
        ]);

        let arranged = rearrange(Some(&previous), &next, &LabelPolicy::default());
        assert_eq!(arranged.get("ranged").expect("app").tasks.len(), 3);
        assert_eq!(ids(&arranged), vec!["T1", "T2", "T2"]);
    }

    #[test]
    fn non_range_apps_pass_through() {
        let previous: Snapshot =
            std::iter::once(app("plain", &[80], vec![task("A", "h1", &[1]), task("B", "h2", &[2])]))
                .collect();
        let next: Snapshot =
            std::iter::once(app("plain", &[80], vec![task("B", "h2", &[2]), task("A", "h1", &[1])]))
                .collect();

        assert_eq!(rearrange(Some(&previous), &next, &LabelPolicy::default()), next);
    }
}
