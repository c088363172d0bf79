// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// Library root; the interpreter lives in the lisp module.

// <>

pub mod lisp;
