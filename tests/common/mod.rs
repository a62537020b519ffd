// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Not every test binary uses every helper.
#![allow(dead_code)]

pub mod logger;
pub mod sim;
