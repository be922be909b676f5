use std::sync::Once;

use flexi_logger::Logger;

static INIT: Once = Once::new();

#[allow(dead_code)]
pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("runbox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}
