//! Timer list benchmarks: schedule/cancel churn and expiry sweeps.

use std::cell::RefCell;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use routerd_event::callback::callback0;
use routerd_event::clock::ManualClock;
use routerd_event::pool::RefPool;
use routerd_event::timer::{priority, TimerList};
use routerd_event::timeval::TimeVal;

fn fixture() -> (TimerList, Rc<RefCell<ManualClock>>, RefPool) {
    let clock = Rc::new(RefCell::new(ManualClock::new(TimeVal::ZERO)));
    let pool = RefPool::new();
    let list = TimerList::new(clock.clone(), &pool);
    (list, clock, pool)
}

fn bench_schedule_unschedule(c: &mut Criterion) {
    c.bench_function("schedule_unschedule_1k", |b| {
        let (list, _clock, pool) = fixture();
        b.iter(|| {
            let handles: Vec<_> = (0..1000)
                .map(|i| {
                    list.new_oneoff_at(
                        TimeVal::from_millis((i * 7) % 500),
                        callback0(&pool, || ()),
                        priority::DEFAULT,
                    )
                })
                .collect();
            for h in &handles {
                h.unschedule();
            }
        });
    });
}

fn bench_expire_sweep(c: &mut Criterion) {
    c.bench_function("expire_1k_due", |b| {
        b.iter_batched(
            || {
                let (list, clock, pool) = fixture();
                let handles: Vec<_> = (0..1000)
                    .map(|i| {
                        list.new_oneoff_at(
                            TimeVal::from_micros((i * 13) % 10_000),
                            callback0(&pool, || ()),
                            priority::DEFAULT,
                        )
                    })
                    .collect();
                clock.borrow_mut().set(TimeVal::from_secs(1));
                (list, handles)
            },
            |(list, _handles)| list.run(),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_schedule_unschedule, bench_expire_sweep);
criterion_main!(benches);
