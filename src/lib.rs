// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod catalog;
pub mod constellation_store;
pub mod projector;
pub mod star_server;
