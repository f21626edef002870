// SPDX-License-Identifier: Apache-2.0

pub mod cli;
pub mod device;
pub mod format;
pub mod stream;
pub mod util;
