#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;
use loom::thread::JoinHandle;

use snapgate::Gate;
use snapgate::GateConfig;

// Exhaustive interleaving exploration only covers the atomic control-block
// and reclamation-counter operations routed through `crate::utils::sync`
// (the Gate's control word, a version's `inner_state`, and an arena's
// free-stack top) — those are the only primitives this crate builds on
// `loom::sync::atomic` under `--cfg loom`. The thread-index registry and
// arena table are process-wide statics (spec.md §9 "Global mutable
// state"), built once via `std::sync::LazyLock`/`std::thread_local!`
// rather than reconstructed per model iteration, so their one-time
// initialization is not itself explored. Thread counts below are kept to
// 2 publishers/readers, the scale loom's state-space search tolerates.

type ArcGate = Arc<Gate<u32>>;

#[test]
fn exchange_detaches_the_previous_version_before_a_concurrent_release() {
  loom::model(|| {
    let gate: ArcGate = Arc::new(Gate::new(GateConfig::new()).unwrap());

    let first = gate.make_version().unwrap();
    first.set_object(1);
    gate.exchange(0, first);

    let acquired = gate.acquire(0).expect("a version was just published");

    let exchanger: JoinHandle<()> = {
      let gate: ArcGate = ArcGate::clone(&gate);
      thread::spawn(move || {
        let second = gate.make_version().unwrap();
        second.set_object(2);
        gate.exchange(0, second);
      })
    };

    exchanger.join().unwrap();

    // S4: as long as `acquired` is held, its payload must still read 1 —
    // the slot cannot have been recycled and reused for a different
    // handle while an acquire against it is outstanding.
    assert_eq!(*acquired.get(), 1);
    acquired.release();
  });
}

#[test]
fn concurrent_acquire_and_release_never_double_finalizes() {
  loom::model(|| {
    let gate: ArcGate = Arc::new(Gate::new(GateConfig::new()).unwrap());

    let version = gate.make_version().unwrap();
    version.set_object(7);
    gate.exchange(0, version);

    let reader_a: JoinHandle<()> = {
      let gate: ArcGate = ArcGate::clone(&gate);
      thread::spawn(move || {
        let v = gate.acquire(0).unwrap();
        assert_eq!(*v.get(), 7);
        v.release();
      })
    };

    let reader_b: JoinHandle<()> = {
      let gate: ArcGate = ArcGate::clone(&gate);
      thread::spawn(move || {
        let v = gate.acquire(0).unwrap();
        assert_eq!(*v.get(), 7);
        v.release();
      })
    };

    reader_a.join().unwrap();
    reader_b.join().unwrap();
  });
}

#[test]
fn compare_exchange_is_linearizable_under_concurrent_attempts() {
  loom::model(|| {
    let gate: ArcGate = Arc::new(Gate::new(GateConfig::new()).unwrap());

    let initial = gate.make_version().unwrap();
    initial.set_object(0);
    gate.exchange(0, initial);

    let baseline = gate.acquire(0).unwrap();

    let attempt_a: JoinHandle<bool> = {
      let gate: ArcGate = ArcGate::clone(&gate);
      thread::spawn(move || {
        let candidate = gate.make_version().unwrap();
        candidate.set_object(1);

        match gate.compare_exchange(0, baseline, candidate) {
          Ok(()) => true,
          Err(_) => {
            candidate.free_unpublished();
            false
          }
        }
      })
    };

    let attempt_b: JoinHandle<bool> = {
      let gate: ArcGate = ArcGate::clone(&gate);
      thread::spawn(move || {
        let candidate = gate.make_version().unwrap();
        candidate.set_object(2);

        match gate.compare_exchange(0, baseline, candidate) {
          Ok(()) => true,
          Err(_) => {
            candidate.free_unpublished();
            false
          }
        }
      })
    };

    let won_a = attempt_a.join().unwrap();
    let won_b = attempt_b.join().unwrap();

    // Invariant 4: exactly one compare_exchange against the same expected
    // handle may succeed.
    assert_ne!(won_a, won_b, "exactly one compare_exchange should win");

    baseline.release();

    let current = gate.acquire(0).unwrap();
    assert!(*current.get() == 1 || *current.get() == 2);
    current.release();
  });
}
