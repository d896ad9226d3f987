//! Property tests over pair generation: coverage and breadth guarantees
//! must hold for arbitrary role assignments, not just the hand-picked
//! drivers in the unit tests.

use drover_engine::{pairing, DeviceDriver, PairingMethod};
use proptest::prelude::*;

const ROLES: &[&str] = &[
    "irq", "read", "write", "ioctl", "remove", "suspend", "shutdown", "ndo_open", "ndo_stop",
];

fn driver_strategy() -> impl Strategy<Value = DeviceDriver> {
    proptest::collection::vec(0..ROLES.len(), 0..6).prop_map(|roles| {
        let mut text = String::from("<m>\nprobe::drv_init\n");
        for (i, role) in roles.iter().enumerate() {
            text.push_str(&format!("{}::ep{i}\n", ROLES[*role]));
        }
        text.push_str("</>\n");
        DeviceDriver::parse(&text).expect("generated driver info parses")
    })
}

proptest! {
    #[test]
    fn triangular_covers_concurrent_pairs_exactly_once(driver in driver_strategy()) {
        let pairs = pairing::generate_pairs(&driver, PairingMethod::Triangular);
        let eps: Vec<_> = driver.entry_points.iter().collect();
        for (i, a) in eps.iter().enumerate() {
            for b in &eps[i..] {
                let concurrent =
                    DeviceDriver::can_run_concurrently(&a.kernel_func, &b.kernel_func);
                let covered = pairs.iter().filter(|p| p.covers(&a.name, &b.name)).count();
                prop_assert_eq!(
                    covered,
                    usize::from(concurrent),
                    "pair ({}, {})",
                    &a.name,
                    &b.name
                );
            }
        }
    }

    #[test]
    fn linear_covers_everything_triangular_does(driver in driver_strategy()) {
        let triangular = pairing::generate_pairs(&driver, PairingMethod::Triangular);
        let linear = pairing::generate_pairs(&driver, PairingMethod::Linear);
        for pair in &triangular {
            prop_assert!(
                linear.iter().any(|g| g.covers(&pair.logger, &pair.checkers[0])),
                "({}, {}) lost under linear grouping",
                &pair.logger,
                &pair.checkers[0]
            );
        }
    }

    #[test]
    fn quadratic_generates_every_ordered_pair(driver in driver_strategy()) {
        let pairs = pairing::generate_pairs(&driver, PairingMethod::Quadratic);
        for a in &driver.entry_points {
            for b in &driver.entry_points {
                if !DeviceDriver::can_run_concurrently(&a.kernel_func, &b.kernel_func) {
                    continue;
                }
                prop_assert!(
                    pairs
                        .iter()
                        .any(|p| p.logger == a.name && p.checkers == [b.name.clone()]),
                    "ordered pair ({}, {}) missing",
                    &a.name,
                    &b.name
                );
            }
        }
    }

    #[test]
    fn generation_is_idempotent(driver in driver_strategy()) {
        for method in [
            PairingMethod::Linear,
            PairingMethod::Triangular,
            PairingMethod::Quadratic,
        ] {
            prop_assert_eq!(
                pairing::generate_pairs(&driver, method),
                pairing::generate_pairs(&driver, method)
            );
        }
    }
}
