//! Built-in classes implemented on top of the extension API.

pub mod regexp;

use crate::runtime::Runtime;

/// Register every built-in's native methods.
pub fn install(rt: &mut Runtime) {
    regexp::install(rt);
    log::debug!("builtins: installed Regexp and MatchData");
}
