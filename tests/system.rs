use runbox::system::{cpu_count, energy_difference, parse_swap_counts, CpuThrottleCheck, EnergyMeasurement, SwapCheck};

mod common;

#[test]
fn swap_counts_from_vmstat() {
  common::setup();
  let vmstat = "nr_free_pages 12345\npswpin 7\npswpout 12\npgfault 99\n";
  let counts = parse_swap_counts(vmstat);
  assert_eq!(counts.len(), 2);
  assert_eq!(counts.get("pswpin"), Some(&7));
  assert_eq!(counts.get("pswpout"), Some(&12));
}

#[test]
fn energy_counter_wraps_around() {
  common::setup();
  assert_eq!(energy_difference(100, 250, 1000), 150);
  assert_eq!(energy_difference(900, 50, 1000), 150);
  assert_eq!(energy_difference(5, 5, 1000), 0);
}

#[test]
fn host_checks_can_be_read() {
  common::setup();
  assert!(cpu_count() >= 1);
  let throttle = CpuThrottleCheck::new(Some(&[0]));
  let _ = throttle.has_throttled();
  let swap = SwapCheck::new();
  let _ = swap.has_swapped();

  if let Some(energy) = EnergyMeasurement::start() {
    let result = energy.stop();
    if let Some((domain, total)) = result.first() {
      assert_eq!(domain, "cpu");
      let sum: f64 = result.iter().skip(1).map(|(_, joules)| joules).sum();
      assert!((sum - total).abs() < 1e-9);
    }
  }
}
