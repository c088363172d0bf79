// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Command line entry point. Parses the mode, then hands the runtime
// to a dedicated interpreter thread with room for deep recursion.

// <>

use kestrel::lisp::{Config, Obj, Runtime};

use std::env;
use std::path::Path;
use std::process;
use std::thread;

/// Native stack reserved per level of evaluation depth
const FRAME_BYTES: usize = 32 * 1024;

fn main() {
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init()
    {
        eprintln!("logger unavailable: {}", e);
    }

    // kestrel [repl] for the REPL
    // kestrel file <path> to evaluate a file
    // kestrel run <image> to autorun an image, then the REPL
    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).cloned().unwrap_or_else(|| "repl".to_string());
    let target = args.get(2).cloned();

    let mut config = Config::default();
    if mode == "run" {
        let image = match &target {
            Some(image) => Path::new(image),
            None => usage(),
        };
        if let Some(dir) = image.parent().filter(|d| !d.as_os_str().is_empty()) {
            config.storage = dir.to_path_buf();
        }
        if let Some(name) = image.file_name() {
            config.image = name.to_string_lossy().into_owned();
        }
        config.autorun = true;
    }

    let interpreter = thread::Builder::new()
        .name("interpreter".to_string())
        .stack_size(config.max_depth * FRAME_BYTES)
        .spawn(move || run(&mode, target, config));

    let code = match interpreter.map(|handle| handle.join()) {
        Ok(Ok(code)) => code,
        _ => {
            eprintln!("interpreter thread failed");
            1
        }
    };
    process::exit(code);
}

fn run(mode: &str, target: Option<String>, config: Config) -> i32 {
    let mut rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let result = match (mode, target) {
        ("file", Some(path)) => rt.run_file(Path::new(&path)).map(|out| println!("{}", out)),
        ("repl", _) | ("run", _) => rt.repl(Obj::NIL),
        _ => usage(),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn usage() -> ! {
    eprintln!("usage: kestrel [repl | file <path> | run <image>]");
    process::exit(2);
}
