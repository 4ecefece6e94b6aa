// Copyright 2026 The megolm-engine contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wrappers over the vodozemac Olm and Megolm primitives.

mod account;
mod group_sessions;
mod session;

pub use account::{Account, IdentityKeys, InboundCreationResult};
pub use group_sessions::{InboundGroupSession, OutboundGroupSession};
pub use session::Session;
