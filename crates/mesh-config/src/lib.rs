// SPDX-License-Identifier: Apache-2.0
//! Config storage port and typed service on top of it, used by `mesh-service`
//! to load and persist `MeshConfig`.

pub mod config;
