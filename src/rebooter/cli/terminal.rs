/*
 * Copyright (C) 2024 The AMT Rebooter Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::io::{self, Write};

/// Command output for operators, kept apart from the structured log stream.
/// Write errors (a closed pipe, usually) are ignored.
pub struct Terminal;

impl Terminal {
    pub fn stdout(args: fmt::Arguments<'_>) {
        let _ = emit(&mut io::stdout().lock(), args);
    }

    /// Prints pre-rendered lines, such as a table, in one locked write.
    pub fn stdout_lines<I>(lines: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut out = io::stdout().lock();
        for line in lines {
            if emit(&mut out, format_args!("{}", line.as_ref())).is_err() {
                return;
            }
        }
    }
}

fn emit(out: &mut impl Write, args: fmt::Arguments<'_>) -> io::Result<()> {
    out.write_fmt(args)?;
    out.write_all(b"\n")
}
