use super::*;
use crate::EventBus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn ctx() -> TickContext {
    TickContext::new(Blackboard::new(), EventBus::new())
}

/// Action that replays a scripted list of outcomes, then repeats the last.
struct Scripted {
    outcomes: Vec<Status>,
    calls: Arc<AtomicU32>,
}

fn scripted(outcomes: &[Status]) -> (Node, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let node = Node::action(
        "scripted",
        Scripted {
            outcomes: outcomes.to_vec(),
            calls: calls.clone(),
        },
    );
    (node, calls)
}

#[async_trait]
impl Action for Scripted {
    async fn execute(&mut self, _blackboard: &Blackboard) -> anyhow::Result<Status> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(*self
            .outcomes
            .get(call)
            .or(self.outcomes.last())
            .unwrap_or(&Status::Failure))
    }
}

fn always(status: Status) -> Node {
    Node::action_fn("always", move |_| async move { Ok(status) })
}

#[tokio::test]
async fn sequence_requires_every_child() {
    let mut seq = Node::sequence("seq");
    seq.add_child(always(Status::Success)).unwrap();
    seq.add_child(always(Status::Success)).unwrap();
    assert_eq!(seq.tick(&ctx()).await, Status::Success);
    seq.add_child(always(Status::Failure)).unwrap();
    assert_eq!(seq.tick(&ctx()).await, Status::Failure);
}

#[tokio::test]
async fn empty_sequence_succeeds_and_empty_selector_fails() {
    assert_eq!(Node::sequence("s").tick(&ctx()).await, Status::Success);
    assert_eq!(Node::selector("f").tick(&ctx()).await, Status::Failure);
}

#[tokio::test]
async fn sequence_resumes_on_the_running_child() {
    let mut seq = Node::sequence("seq");
    let (first, first_calls) = scripted(&[Status::Success]);
    let (second, _) = scripted(&[Status::Running, Status::Success]);
    let (third, third_calls) = scripted(&[Status::Success]);
    seq.add_child(first).unwrap();
    seq.add_child(second).unwrap();
    seq.add_child(third).unwrap();

    let ctx = ctx();
    assert_eq!(seq.tick(&ctx).await, Status::Running);
    assert_eq!(seq.running_child_index(), Some(1));
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    assert_eq!(seq.tick(&ctx).await, Status::Success);
    assert_eq!(seq.running_child_index(), Some(0));
    // The finished child is not re-entered and the tail runs exactly once.
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(third_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn selector_falls_back_after_failures() {
    let mut sel = Node::selector("sel");
    let (failing, fail_calls) = scripted(&[Status::Failure]);
    sel.add_child(failing).unwrap();
    sel.add_child(always(Status::Success)).unwrap();
    assert_eq!(sel.tick(&ctx()).await, Status::Success);
    assert_eq!(fail_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn selector_resumes_on_the_running_child() {
    let mut sel = Node::selector("sel");
    let (first, first_calls) = scripted(&[Status::Failure]);
    let (second, _) = scripted(&[Status::Running, Status::Success]);
    sel.add_child(first).unwrap();
    sel.add_child(second).unwrap();

    let ctx = ctx();
    assert_eq!(sel.tick(&ctx).await, Status::Running);
    assert_eq!(sel.running_child_index(), Some(1));
    assert_eq!(sel.tick(&ctx).await, Status::Success);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_require_all() {
    let mut par = Node::parallel("par", Policy::RequireAll);
    let (steady, _) = scripted(&[Status::Success]);
    let (flaky, _) = scripted(&[Status::Running, Status::Failure]);
    par.add_child(steady).unwrap();
    par.add_child(flaky).unwrap();

    let ctx = ctx();
    assert_eq!(par.tick(&ctx).await, Status::Running);
    assert_eq!(par.tick(&ctx).await, Status::Failure);
}

#[tokio::test]
async fn parallel_reticks_every_child_each_round() {
    let mut par = Node::parallel("par", Policy::RequireAll);
    let (done, done_calls) = scripted(&[Status::Success]);
    let (slow, slow_calls) = scripted(&[Status::Running, Status::Running, Status::Success]);
    par.add_child(done).unwrap();
    par.add_child(slow).unwrap();

    let ctx = ctx();
    assert_eq!(par.tick(&ctx).await, Status::Running);
    assert_eq!(par.tick(&ctx).await, Status::Running);
    assert_eq!(par.tick(&ctx).await, Status::Success);
    // All children run in every round, finished ones included.
    assert_eq!(done_calls.load(Ordering::SeqCst), 3);
    assert_eq!(slow_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn parallel_require_one() {
    let mut par = Node::parallel("par", Policy::RequireOne);
    par.add_child(always(Status::Failure)).unwrap();
    par.add_child(always(Status::Success)).unwrap();
    assert_eq!(par.tick(&ctx()).await, Status::Success);

    let mut par = Node::parallel("par", Policy::RequireOne);
    par.add_child(always(Status::Failure)).unwrap();
    par.add_child(always(Status::Failure)).unwrap();
    assert_eq!(par.tick(&ctx()).await, Status::Failure);
}

#[tokio::test]
async fn empty_parallel_follows_policy() {
    assert_eq!(
        Node::parallel("p", Policy::RequireAll).tick(&ctx()).await,
        Status::Success
    );
    assert_eq!(
        Node::parallel("p", Policy::RequireOne).tick(&ctx()).await,
        Status::Failure
    );
}

#[tokio::test]
async fn inverter_swaps_and_passes_running() {
    for (inner, expected) in [
        (Status::Success, Status::Failure),
        (Status::Failure, Status::Success),
        (Status::Running, Status::Running),
    ] {
        let mut inv = Node::inverter("inv");
        inv.add_child(always(inner)).unwrap();
        assert_eq!(inv.tick(&ctx()).await, expected);
    }
}

#[tokio::test]
async fn decorator_arity_is_enforced() {
    let mut inv = Node::inverter("inv");
    inv.add_child(always(Status::Success)).unwrap();
    assert!(inv.add_child(always(Status::Success)).is_err());
    assert!(always(Status::Success)
        .add_child(always(Status::Success))
        .is_err());
}

#[tokio::test]
async fn repeater_counts_successes_in_one_tick() {
    let mut rep = Node::repeater("rep", Some(3));
    let (child, calls) = scripted(&[Status::Success]);
    rep.add_child(child).unwrap();
    assert_eq!(rep.tick(&ctx()).await, Status::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn repeater_zero_skips_the_child() {
    let mut rep = Node::repeater("rep", Some(0));
    let (child, calls) = scripted(&[Status::Success]);
    rep.add_child(child).unwrap();
    assert_eq!(rep.tick(&ctx()).await, Status::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeater_preserves_progress_across_running() {
    let mut rep = Node::repeater("rep", Some(2));
    let (child, calls) = scripted(&[Status::Success, Status::Running, Status::Success]);
    rep.add_child(child).unwrap();

    let ctx = ctx();
    assert_eq!(rep.tick(&ctx).await, Status::Running);
    assert_eq!(rep.tick(&ctx).await, Status::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn repeater_failure_resets_the_counter() {
    let mut rep = Node::repeater("rep", Some(3));
    let (child, _) = scripted(&[Status::Success, Status::Failure]);
    rep.add_child(child).unwrap();
    assert_eq!(rep.tick(&ctx()).await, Status::Failure);
    match rep.kind() {
        NodeKind::Repeater { completed, .. } => assert_eq!(*completed, 0),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn until_success_retries_across_ticks() {
    let mut until = Node::until_success("until", None);
    let (child, _) = scripted(&[Status::Failure, Status::Success]);
    until.add_child(child).unwrap();

    let ctx = ctx();
    assert_eq!(until.tick(&ctx).await, Status::Running);
    assert_eq!(until.tick(&ctx).await, Status::Success);
}

#[tokio::test]
async fn until_success_reports_failure_on_exhaustion() {
    let mut until = Node::until_success("until", Some(2));
    until.add_child(always(Status::Failure)).unwrap();

    let ctx = ctx();
    assert_eq!(until.tick(&ctx).await, Status::Running);
    assert_eq!(until.tick(&ctx).await, Status::Failure);
}

#[tokio::test]
async fn until_failure_mirrors_until_success() {
    let mut until = Node::until_failure("until", None);
    let (child, _) = scripted(&[Status::Success, Status::Failure]);
    until.add_child(child).unwrap();

    let ctx = ctx();
    assert_eq!(until.tick(&ctx).await, Status::Running);
    assert_eq!(until.tick(&ctx).await, Status::Success);
}

#[tokio::test]
async fn wait_zero_succeeds_on_the_first_tick() {
    let mut wait = Node::wait("wait", Duration::ZERO);
    assert_eq!(wait.tick(&ctx()).await, Status::Success);
}

#[tokio::test]
async fn wait_runs_until_the_deadline() {
    let mut wait = Node::wait("wait", Duration::from_millis(30));
    let ctx = ctx();
    assert_eq!(wait.tick(&ctx).await, Status::Running);
    assert_eq!(wait.tick(&ctx).await, Status::Running);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(wait.tick(&ctx).await, Status::Success);
    // The deadline is gone; the next activation arms a fresh one.
    assert_eq!(wait.tick(&ctx).await, Status::Running);
}

#[tokio::test]
async fn blackboard_leaves_read_and_write() {
    let ctx = ctx();
    let mut set = Node::set_blackboard("set", "door_open", true);
    assert_eq!(set.tick(&ctx).await, Status::Success);

    let mut check = Node::check_blackboard("check", "door_open", true);
    assert_eq!(check.tick(&ctx).await, Status::Success);

    let mut check = Node::check_blackboard("check", "door_open", false);
    assert_eq!(check.tick(&ctx).await, Status::Failure);

    let mut check = Node::check_blackboard("check", "missing", true);
    assert_eq!(check.tick(&ctx).await, Status::Failure);
}

#[tokio::test]
async fn compare_resolves_keys_and_literals() {
    let ctx = ctx();
    ctx.blackboard().set("battery", 35).await;

    let mut low = Node::compare(
        "low",
        Operand::Key("battery".into()),
        CompareOp::Lt,
        Operand::Literal(Value::Int(40)),
    );
    assert_eq!(low.tick(&ctx).await, Status::Success);

    let mut auto = Node::compare(
        "auto",
        Operand::Auto("battery".into()),
        CompareOp::Ge,
        Operand::Auto("35".into()),
    );
    assert_eq!(auto.tick(&ctx).await, Status::Success);

    let mut missing = Node::compare(
        "missing",
        Operand::Key("absent".into()),
        CompareOp::Eq,
        Operand::Literal(Value::Int(1)),
    );
    assert_eq!(missing.tick(&ctx).await, Status::Failure);
}

#[tokio::test]
async fn failing_action_becomes_failure_and_reports() {
    let ctx = ctx();
    let mut node = Node::action_fn("broken", |_| async { anyhow::bail!("sensor offline") });
    let report = ctx.events().wait_for(ERROR, Some(Duration::from_secs(1)));
    let (report, status) = tokio::join!(report, node.tick(&ctx));
    assert_eq!(status, Status::Failure);
    let event = report.expect("error event");
    assert_eq!(
        event.payload.get("detail"),
        Some(&Value::Str("sensor offline".into()))
    );
}

#[tokio::test]
async fn log_emits_an_event() {
    let ctx = ctx();
    let mut node = Node::log("log", "closing");
    let logged = ctx.events().wait_for(LOG, Some(Duration::from_secs(1)));
    let (logged, status) = tokio::join!(logged, node.tick(&ctx));
    assert_eq!(status, Status::Success);
    let event = logged.expect("log event");
    assert_eq!(
        event.payload.get("message"),
        Some(&Value::Str("closing".into()))
    );
}

#[tokio::test]
async fn status_changes_are_announced_with_the_node_path() {
    let ctx = ctx();
    let mut seq = Node::sequence("root");
    seq.add_child(always(Status::Success)).unwrap();
    let announced = ctx
        .events()
        .wait_for(STATUS_CHANGED, Some(Duration::from_secs(1)));
    let (announced, _) = tokio::join!(announced, seq.tick(&ctx));
    let event = announced.expect("status event");
    let path = event.payload.get("path").and_then(Value::as_str).unwrap();
    assert!(path.starts_with("/root"));
}

#[tokio::test]
async fn reset_wipes_running_state_everywhere() {
    let mut seq = Node::sequence("seq");
    let (stuck, _) = scripted(&[Status::Running]);
    seq.add_child(always(Status::Success)).unwrap();
    seq.add_child(stuck).unwrap();

    let ctx = ctx();
    assert_eq!(seq.tick(&ctx).await, Status::Running);
    assert_eq!(seq.running_child_index(), Some(1));

    seq.reset();
    assert_eq!(seq.running_child_index(), Some(0));
    assert_eq!(seq.status(), Status::Failure);
    let mut statuses = Vec::new();
    seq.visit(&mut |node| statuses.push(node.status()));
    assert!(statuses.iter().all(|s| *s == Status::Failure));
}

struct CountingGate {
    open_after: u32,
    seen: u32,
}

#[async_trait]
impl Behavior for CountingGate {
    async fn tick(&mut self, children: &mut [Node], ctx: &TickContext) -> Status {
        self.seen += 1;
        if self.seen <= self.open_after {
            return Status::Running;
        }
        match children.first_mut() {
            Some(child) => child.tick(ctx).await,
            None => Status::Success,
        }
    }

    fn reset(&mut self) {
        self.seen = 0;
    }
}

#[tokio::test]
async fn custom_behaviors_can_gate_their_children() {
    let mut gate = Node::custom(
        "gate",
        "CountingGate",
        CountingGate {
            open_after: 1,
            seen: 0,
        },
    );
    gate.add_child(always(Status::Success)).unwrap();

    let ctx = ctx();
    assert_eq!(gate.tick(&ctx).await, Status::Running);
    assert_eq!(gate.tick(&ctx).await, Status::Success);
    gate.reset();
    assert_eq!(gate.tick(&ctx).await, Status::Running);
}

#[tokio::test]
async fn cancellation_surfaces_as_running() {
    let ctx = ctx();
    ctx.cancellation().cancel();
    let mut seq = Node::sequence("seq");
    let (child, calls) = scripted(&[Status::Success]);
    seq.add_child(child).unwrap();
    assert_eq!(seq.tick(&ctx).await, Status::Running);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
