use std::sync::Once;

pub type TestResult<T = ()> = color_eyre::eyre::Result<T>;

static COLOR_EYRE_INSTALL: Once = Once::new();
pub fn install() {
    COLOR_EYRE_INSTALL.call_once(|| {
        let _ = color_eyre::install();
    });
}

macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left_val, right_val) => {
                ::color_eyre::eyre::ensure!(
                    left_val == right_val,
                    "expected `{left_val:?}` to equal `{right_val:?}`"
                );
            }
        }
    };
    ($left:expr, $right:expr, $($arg:tt)+) => {
        match (&$left, &$right) {
            (left_val, right_val) => {
                ::color_eyre::eyre::ensure!(
                    left_val == right_val,
                    "expected `{left_val:?}` to equal `{right_val:?}`: {}",
                    ::core::format_args!($($arg)+)
                );
            }
        }
    };
}
