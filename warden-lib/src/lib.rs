// SPDX-License-Identifier: GPL-2.0-only
pub mod config;
pub mod dispatch;
pub mod prefs;
pub mod reconciler;
pub mod registry;
pub mod vm;
