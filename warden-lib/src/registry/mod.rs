// SPDX-License-Identifier: GPL-2.0-only
pub mod memory;
pub mod qadmin;
pub mod traits;
