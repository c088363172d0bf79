// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/forms.rs

// Special forms, which receive their arguments unevaluated, and tail
// forms, which hand their final form back to the evaluator.

// <>

use super::{
    core::{latin1, Obj, SymId},
    eval::{Step, TRACEMAX},
    stdenv::Builtin,
    stream::{self, FilePort, Kind, Mode},
    LispErr, Runtime,
};

use std::thread;
use std::time::{Duration, Instant};

impl Runtime {
    /// Evaluates all but the last form, which is returned as a tail step
    pub(crate) fn progn(&mut self, mut args: Obj, env: Obj) -> Result<Step, LispErr> {
        if args.is_nil() {
            return Ok(Step::Done(Obj::NIL));
        }

        let mut more = self.arena.cdr(args);
        while !more.is_nil() {
            let result = self.eval(self.arena.car(args), env)?;
            if self.return_flag {
                return Ok(Step::Done(result));
            }
            args = more;
            more = self.arena.cdr(args);
        }

        Ok(Step::Tail(self.arena.car(args)))
    }

    /// An implicit progn evaluated to completion
    pub(crate) fn run_body(&mut self, body: Obj, env: Obj) -> Result<Obj, LispErr> {
        let step = self.progn(body, env)?;
        self.finish(step, env)
    }

    /// Binds or rebinds a global variable
    fn define(&mut self, var: Obj, val: Obj) -> Result<(), LispErr> {
        let found = self
            .arena
            .sym(var)
            .and_then(|id| self.value(id, self.global_env));

        match found {
            Some(pair) => self.arena.set_cdr(pair, val),
            None => {
                let pair = self.arena.cons(var, val)?;
                self.global_env = self.arena.cons(pair, self.global_env)?;
            }
        }
        Ok(())
    }

    fn traced_list(&mut self) -> Result<Obj, LispErr> {
        let mut list = Obj::NIL;
        for i in 0..TRACEMAX {
            if self.trace_fn[i] != 0 {
                let sym = self.arena.symbol(self.trace_fn[i])?;
                list = self.arena.cons(sym, list)?;
            }
        }
        Ok(list)
    }

    fn trace_symbol(&mut self, name: SymId) -> Result<(), LispErr> {
        if self.tracing(name).is_some() {
            let sym = self.arena.symbol(name)?;
            return Err(self.err_obj(Builtin::Trace, "already being traced", sym));
        }

        match self.trace_fn.iter().position(|&t| t == 0) {
            Some(i) => {
                self.trace_fn[i] = name;
                self.trace_depth[i] = 0;
                Ok(())
            }
            None => Err(self.err(Builtin::Trace, "already tracing 3 functions")),
        }
    }

    fn untrace_symbol(&mut self, name: SymId) -> Result<(), LispErr> {
        match self.tracing(name) {
            Some(i) => {
                self.trace_fn[i] = 0;
                Ok(())
            }
            None => {
                let sym = self.arena.symbol(name)?;
                Err(self.err_obj(Builtin::Untrace, "not tracing", sym))
            }
        }
    }

    fn symbol_arg(&self, name: Builtin, obj: Obj) -> Result<SymId, LispErr> {
        self.arena
            .sym(obj)
            .ok_or_else(|| self.err_obj(name, "not a symbol", obj))
    }

    /// Evaluates an integer-valued parameter
    fn int_param(&mut self, name: Builtin, form: Obj, env: Obj) -> Result<i32, LispErr> {
        let value = self.eval(form, env)?;
        self.checkinteger(name.id(), value)
    }

    /// Runs a body with a variable bound to a device stream
    ///
    /// The variable is nil when no port serves the address or the port
    /// did not start.
    fn device_scope(
        &mut self,
        kind: Kind,
        address: i32,
        var: Obj,
        body: Obj,
        env: Obj,
    ) -> Result<Obj, LispErr> {
        let desc = stream::descriptor(kind, address as u8);
        let live = (0..=255).contains(&address)
            && self.ports.port_mut(desc).map_or(false, |p| p.begin());

        let value = if live {
            self.arena.stream(desc)?
        } else {
            Obj::NIL
        };
        let pair = self.arena.cons(var, value)?;
        let env = self.arena.cons(pair, env)?;

        let result = self.run_body(body, env);
        if live {
            if let Some(port) = self.ports.port_mut(desc) {
                port.end()?;
            }
        }
        result
    }

    /// Runs a body with a variable bound to a storage file stream
    fn file_scope(
        &mut self,
        name: Builtin,
        kind: Kind,
        args: Obj,
        env: Obj,
        failures: [&'static str; 2],
    ) -> Result<Obj, LispErr> {
        let params = self.arena.car(args);
        let var = self.arena.car(params);

        let filename = self.eval(self.arena.second(params), env)?;
        let filename = self.checkstring(name.id(), filename)?;
        let filename = latin1(&self.arena.string_bytes(filename));

        // the mode is taken literally
        let rest = self.arena.cdr(self.arena.cdr(params));
        let mode = match self.arena.car(rest) {
            m if m.is_nil() => Mode::Read,
            m => Mode::from_code(self.checkinteger(name.id(), m)?),
        };

        let path = self.config.storage.join(&filename);
        let port = FilePort::open(&path, mode).map_err(|e| {
            log::debug!("{}: {}", path.display(), e);
            let msg = if mode == Mode::Read {
                failures[0]
            } else {
                failures[1]
            };
            self.err(name, msg)
        })?;

        let desc = stream::descriptor(kind, 1);
        self.ports.register(desc, Box::new(port));

        let result = self
            .arena
            .stream(desc)
            .and_then(|s| self.arena.cons(var, s))
            .and_then(|pair| self.arena.cons(pair, env))
            .and_then(|env| self.run_body(self.arena.cdr(args), env));

        let closed = self.ports.remove(desc).map(|mut port| port.end());
        let value = result?;
        if let Some(closed) = closed {
            closed?;
        }
        Ok(value)
    }
}

// special forms

pub fn sp_quote(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.arena.car(args))
}

pub fn sp_defun(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let var = rt.arena.car(args);
    rt.symbol_arg(Builtin::Defun, var)?;

    let lambda = rt.arena.symbol(Builtin::Lambda.id())?;
    let val = rt.arena.cons(lambda, rt.arena.cdr(args))?;
    rt.define(var, val)?;
    Ok(var)
}

pub fn sp_defvar(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let var = rt.arena.car(args);
    rt.symbol_arg(Builtin::Defvar, var)?;

    let val = rt.eval(rt.arena.second(args), env)?;
    rt.define(var, val)?;
    Ok(var)
}

pub fn sp_setq(rt: &mut Runtime, mut args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let mut arg = Obj::NIL;
    while !args.is_nil() {
        if rt.arena.cdr(args).is_nil() {
            return Err(rt.err(Builtin::Setq, "odd number of parameters"));
        }
        let pair = rt.findvalue(rt.arena.car(args), env)?;
        arg = rt.eval(rt.arena.second(args), env)?;
        rt.arena.set_cdr(pair, arg);
        args = rt.arena.cdr(rt.arena.cdr(args));
    }
    Ok(arg)
}

pub fn sp_loop(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    loop {
        rt.test_escape()?;

        let mut forms = args;
        while !forms.is_nil() {
            let result = rt.eval(rt.arena.car(forms), env)?;
            if rt.return_flag {
                rt.return_flag = false;
                return Ok(result);
            }
            forms = rt.arena.cdr(forms);
        }
    }
}

pub fn sp_return(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let result = rt.run_body(args, env)?;
    rt.return_flag = true;
    Ok(result)
}

pub fn sp_push(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let item = rt.eval(rt.arena.car(args), env)?;
    rt.push_gc(item)?;

    let place = rt.place(Builtin::Push.id(), rt.arena.second(args), env)?;
    let list = rt.arena.cons(item, rt.place_get(place))?;
    rt.place_set(place, list);

    rt.pop_gc();
    Ok(list)
}

pub fn sp_pop(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let place = rt.place(Builtin::Pop.id(), rt.arena.car(args), env)?;
    let list = rt.place_get(place);
    rt.place_set(place, rt.arena.cdr(list));
    Ok(rt.arena.car(list))
}

/// Shared body of incf and decf; sign is 1 or -1
fn step_place(rt: &mut Runtime, name: Builtin, sign: i32, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let place = rt.place(name.id(), rt.arena.car(args), env)?;
    rt.push_gc(Runtime::place_cell(place))?;

    let delta = match rt.arena.cdr(args) {
        rest if rest.is_nil() => Obj::NIL,
        rest => rt.eval(rt.arena.car(rest), env)?,
    };
    let x = rt.place_get(place);

    let result = if rt.arena.floatp(x) || rt.arena.floatp(delta) {
        let value = rt.checkintfloat(name.id(), x)?;
        let step = match delta {
            d if d.is_nil() => 1.0,
            d => rt.checkintfloat(name.id(), d)?,
        };
        rt.arena.makefloat(value + sign as f32 * step)?
    } else {
        let step = match delta {
            d if d.is_nil() => Some(1),
            d => rt.arena.int(d),
        };
        match (rt.arena.int(x), step) {
            (Some(value), Some(step)) => {
                let sum = if sign > 0 {
                    value.checked_add(step)
                } else {
                    value.checked_sub(step)
                };
                match sum {
                    Some(n) => rt.arena.number(n)?,
                    None => rt.arena.makefloat(value as f32 + sign as f32 * step as f32)?,
                }
            }
            _ => return Err(rt.err(name, "argument is not a number")),
        }
    };

    rt.place_set(place, result);
    rt.pop_gc();
    Ok(result)
}

pub fn sp_incf(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    step_place(rt, Builtin::Incf, 1, args, env)
}

pub fn sp_decf(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    step_place(rt, Builtin::Decf, -1, args, env)
}

pub fn sp_setf(rt: &mut Runtime, mut args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let mut arg = Obj::NIL;
    while !args.is_nil() {
        if rt.arena.cdr(args).is_nil() {
            return Err(rt.err(Builtin::Setf, "odd number of parameters"));
        }
        let place = rt.place(Builtin::Setf.id(), rt.arena.car(args), env)?;
        rt.push_gc(Runtime::place_cell(place))?;
        arg = rt.eval(rt.arena.second(args), env)?;
        rt.place_set(place, arg);
        rt.pop_gc();
        args = rt.arena.cdr(rt.arena.cdr(args));
    }
    Ok(arg)
}

pub fn sp_dolist(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let params = rt.arena.car(args);
    let var = rt.arena.car(params);

    let mut list = rt.eval(rt.arena.second(params), env)?;
    rt.push_gc(list)?;

    let pair = rt.arena.cons(var, Obj::NIL)?;
    let env = rt.arena.cons(pair, env)?;
    let result_form = rt.arena.cdr(rt.arena.cdr(params));
    let body = rt.arena.cdr(args);

    while !list.is_nil() {
        if rt.arena.improperp(list) {
            return Err(rt.err_obj(Builtin::Dolist, "argument is not a proper list", list));
        }
        rt.arena.set_cdr(pair, rt.arena.car(list));

        let mut forms = body;
        while !forms.is_nil() {
            let result = rt.eval(rt.arena.car(forms), env)?;
            if rt.return_flag {
                rt.return_flag = false;
                rt.pop_gc();
                return Ok(result);
            }
            forms = rt.arena.cdr(forms);
        }
        list = rt.arena.cdr(list);
    }

    rt.arena.set_cdr(pair, Obj::NIL);
    rt.pop_gc();

    if result_form.is_nil() {
        Ok(Obj::NIL)
    } else {
        rt.eval(rt.arena.car(result_form), env)
    }
}

pub fn sp_dotimes(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let params = rt.arena.car(args);
    let var = rt.arena.car(params);
    let count = rt.int_param(Builtin::Dotimes, rt.arena.second(params), env)?;

    let zero = rt.arena.number(0)?;
    let pair = rt.arena.cons(var, zero)?;
    let env = rt.arena.cons(pair, env)?;
    let result_form = rt.arena.cdr(rt.arena.cdr(params));
    let body = rt.arena.cdr(args);

    let mut index = 0;
    while index < count {
        let n = rt.arena.number(index)?;
        rt.arena.set_cdr(pair, n);

        let mut forms = body;
        while !forms.is_nil() {
            let result = rt.eval(rt.arena.car(forms), env)?;
            if rt.return_flag {
                rt.return_flag = false;
                return Ok(result);
            }
            forms = rt.arena.cdr(forms);
        }
        index += 1;
    }

    let n = rt.arena.number(index)?;
    rt.arena.set_cdr(pair, n);

    if result_form.is_nil() {
        Ok(Obj::NIL)
    } else {
        rt.eval(rt.arena.car(result_form), env)
    }
}

pub fn sp_trace(rt: &mut Runtime, mut args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    while !args.is_nil() {
        let name = rt.symbol_arg(Builtin::Trace, rt.arena.car(args))?;
        rt.trace_symbol(name)?;
        args = rt.arena.cdr(args);
    }
    rt.traced_list()
}

pub fn sp_untrace(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    if args.is_nil() {
        let list = rt.traced_list()?;
        rt.trace_fn = [0; TRACEMAX];
        return Ok(list);
    }

    let mut rest = args;
    while !rest.is_nil() {
        let name = rt.symbol_arg(Builtin::Untrace, rt.arena.car(rest))?;
        rt.untrace_symbol(name)?;
        rest = rt.arena.cdr(rest);
    }
    Ok(args)
}

pub fn sp_formillis(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let start = Instant::now();
    let param = rt.arena.car(args);
    let total = if param.is_nil() {
        0
    } else {
        rt.int_param(Builtin::ForMillis, rt.arena.car(param), env)?
    };

    rt.run_body(rt.arena.cdr(args), env)?;

    let total = total.max(0) as u128;
    loop {
        let now = start.elapsed().as_millis();
        if now >= total {
            return match i32::try_from(now) {
                Ok(n) => rt.arena.number(n),
                Err(_) => Ok(Obj::NIL),
            };
        }
        rt.test_escape()?;
        thread::sleep(Duration::from_millis((total - now).min(10) as u64));
    }
}

pub fn sp_withserial(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::WithSerial;
    let params = rt.arena.car(args);
    if params.is_nil() {
        return Err(rt.err(name, "missing stream argument"));
    }
    let var = rt.arena.car(params);

    let address = rt.eval(rt.arena.second(params), env)?;
    let n = rt.checkinteger(name.id(), address)?;
    if !(0..=255).contains(&n) || !rt.ports.contains(stream::descriptor(Kind::Serial, n as u8)) {
        return Err(rt.err_obj(name, "port not supported", address));
    }

    // the baud rate is checked; the port owns its line settings
    let rest = rt.arena.cdr(rt.arena.cdr(params));
    if !rest.is_nil() {
        rt.int_param(name, rt.arena.car(rest), env)?;
    }

    rt.device_scope(Kind::Serial, n, var, rt.arena.cdr(args), env)
}

pub fn sp_withi2c(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::WithI2c;
    let params = rt.arena.car(args);
    if params.is_nil() {
        return Err(rt.err(name, "missing stream argument"));
    }
    let var = rt.arena.car(params);
    let address = rt.int_param(name, rt.arena.second(params), env)?;

    let rest = rt.arena.cdr(rt.arena.cdr(params));
    if !rest.is_nil() {
        rt.eval(rt.arena.car(rest), env)?;
    }

    rt.device_scope(Kind::I2c, address, var, rt.arena.cdr(args), env)
}

pub fn sp_withspi(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::WithSpi;
    let params = rt.arena.car(args);
    let mut rest = rt.arena.cdr(params);
    if params.is_nil() || rest.is_nil() {
        return Err(rt.err(name, "missing stream argument"));
    }
    let var = rt.arena.car(params);
    let pin = rt.int_param(name, rt.arena.car(rest), env)?;

    // clock, bit order and mode
    rest = rt.arena.cdr(rest);
    for _ in 0..3 {
        if rest.is_nil() {
            break;
        }
        rt.int_param(name, rt.arena.car(rest), env)?;
        rest = rt.arena.cdr(rest);
    }

    rt.device_scope(Kind::Spi, pin, var, rt.arena.cdr(args), env)
}

pub fn sp_withsdcard(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    rt.file_scope(
        Builtin::WithSdCard,
        Kind::Sd,
        args,
        env,
        ["problem reading from SD card", "problem writing to SD card"],
    )
}

pub fn sp_withspiffs(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    rt.file_scope(
        Builtin::WithSpiffs,
        Kind::Spiffs,
        args,
        env,
        ["problem reading from SPIFFS", "problem writing to SPIFFS"],
    )
}

// tail forms

pub fn tf_progn(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Step, LispErr> {
    rt.progn(args, env)
}

pub fn tf_if(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Step, LispErr> {
    if !rt.eval(rt.arena.car(args), env)?.is_nil() {
        Ok(Step::Tail(rt.arena.second(args)))
    } else {
        Ok(Step::Tail(rt.arena.third(args)))
    }
}

pub fn tf_cond(rt: &mut Runtime, mut args: Obj, env: Obj) -> Result<Step, LispErr> {
    while !args.is_nil() {
        let clause = rt.arena.car(args);
        if !rt.arena.consp(clause) {
            return Err(rt.err_obj(Builtin::Cond, "illegal clause", clause));
        }

        let test = rt.eval(rt.arena.car(clause), env)?;
        if !test.is_nil() {
            let forms = rt.arena.cdr(clause);
            return if forms.is_nil() {
                Ok(Step::Done(test))
            } else {
                rt.progn(forms, env)
            };
        }
        args = rt.arena.cdr(args);
    }
    Ok(Step::Done(Obj::NIL))
}

pub fn tf_when(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Step, LispErr> {
    if rt.eval(rt.arena.car(args), env)?.is_nil() {
        Ok(Step::Done(Obj::NIL))
    } else {
        rt.progn(rt.arena.cdr(args), env)
    }
}

pub fn tf_unless(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Step, LispErr> {
    if rt.eval(rt.arena.car(args), env)?.is_nil() {
        rt.progn(rt.arena.cdr(args), env)
    } else {
        Ok(Step::Done(Obj::NIL))
    }
}

pub fn tf_case(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Step, LispErr> {
    let test = rt.eval(rt.arena.car(args), env)?;

    let mut clauses = rt.arena.cdr(args);
    while !clauses.is_nil() {
        let clause = rt.arena.car(clauses);
        if !rt.arena.consp(clause) {
            return Err(rt.err_obj(Builtin::Case, "illegal clause", clause));
        }

        let mut key = rt.arena.car(clause);
        let forms = rt.arena.cdr(clause);

        if rt.arena.consp(key) {
            while !key.is_nil() {
                if rt.arena.eq(test, rt.arena.car(key)) {
                    return rt.progn(forms, env);
                }
                key = rt.arena.cdr(key);
            }
        } else if rt.arena.eq(test, key) || rt.arena.eq(key, rt.tee) {
            return rt.progn(forms, env);
        }

        clauses = rt.arena.cdr(clauses);
    }
    Ok(Step::Done(Obj::NIL))
}

pub fn tf_and(rt: &mut Runtime, mut args: Obj, env: Obj) -> Result<Step, LispErr> {
    if args.is_nil() {
        return Ok(Step::Done(rt.tee));
    }

    let mut more = rt.arena.cdr(args);
    while !more.is_nil() {
        if rt.eval(rt.arena.car(args), env)?.is_nil() {
            return Ok(Step::Done(Obj::NIL));
        }
        args = more;
        more = rt.arena.cdr(args);
    }
    Ok(Step::Tail(rt.arena.car(args)))
}

pub fn tf_or(rt: &mut Runtime, mut args: Obj, env: Obj) -> Result<Step, LispErr> {
    if args.is_nil() {
        return Ok(Step::Done(Obj::NIL));
    }

    let mut more = rt.arena.cdr(args);
    while !more.is_nil() {
        let value = rt.eval(rt.arena.car(args), env)?;
        if !value.is_nil() {
            return Ok(Step::Done(value));
        }
        args = more;
        more = rt.arena.cdr(args);
    }
    Ok(Step::Tail(rt.arena.car(args)))
}

#[cfg(test)]
mod tests {
    use super::super::{
        stream::{BufferPort, Output},
        Config,
    };
    use super::*;

    use std::fs;

    fn quiet() -> (Runtime, Output) {
        let (console, out) = BufferPort::new(b"");
        let config = Config {
            load_library: false,
            ..Config::default()
        };
        (Runtime::with_console(config, Box::new(console)).unwrap(), out)
    }

    fn run(rt: &mut Runtime, code: &str) -> String {
        rt.eval_str(code).unwrap()
    }

    fn fail(rt: &mut Runtime, code: &str) -> String {
        rt.eval_str(code).unwrap_err().to_string()
    }

    #[test]
    fn definitions() {
        let (mut rt, _) = quiet();

        assert_eq!(run(&mut rt, "(defun f (x) x)"), "f");
        assert_eq!(run(&mut rt, "(defun f (x) (+ x 1)) (f 1)"), "2");
        assert_eq!(run(&mut rt, "(defvar v 1) (defvar v 2) v"), "2");
        assert_eq!(run(&mut rt, "(setq v 5) v"), "5");
        assert_eq!(run(&mut rt, "'(a b)"), "(a b)");
        assert_eq!(fail(&mut rt, "(defun 1 ())"), "'defun' not a symbol: 1");
        assert_eq!(fail(&mut rt, "(setq v)"), "'setq' has too few arguments");
        assert_eq!(fail(&mut rt, "(setq v 1 v)"), "'setq' odd number of parameters");
        assert_eq!(fail(&mut rt, "(quote)"), "'quote' has too few arguments");
    }

    #[test]
    fn iteration() {
        let (mut rt, _) = quiet();

        assert_eq!(
            run(&mut rt, "(let ((s 0)) (dotimes (i 5) (setq s (+ s i))) s)"),
            "10"
        );
        assert_eq!(run(&mut rt, "(dotimes (i 3 i))"), "3");
        assert_eq!(
            run(&mut rt, "(let ((s 0)) (dolist (x '(1 2 3) s) (setq s (+ s x))))"),
            "6"
        );
        assert_eq!(
            run(&mut rt, "(dolist (x '(1 2 3)) (when (= x 2) (return 'found)))"),
            "found"
        );
        assert_eq!(run(&mut rt, "(dolist (x '(1 2 3)))"), "nil");
        assert_eq!(run(&mut rt, "(loop (return 5))"), "5");
        assert_eq!(
            run(&mut rt, "(let ((i 0)) (loop (incf i) (when (> i 3) (return i))))"),
            "4"
        );
        assert_eq!(
            fail(&mut rt, "(dolist (x '(1 . 2)) x)"),
            "'dolist' argument is not a proper list: 2"
        );
        assert!(!rt.return_flag);
    }

    #[test]
    fn places() {
        let (mut rt, _) = quiet();

        assert_eq!(
            run(&mut rt, "(let ((l (list 1 2 3))) (setf (nth 1 l) 'x) (push 0 l) (pop l) l)"),
            "(1 x 3)"
        );
        assert_eq!(run(&mut rt, "(let ((l nil)) (push 1 l))"), "(1)");
        assert_eq!(run(&mut rt, "(let ((x 1)) (incf x) (incf x 10))"), "12");
        assert_eq!(run(&mut rt, "(let ((x 2147483647)) (incf x))"), "2.14748e9");
        assert_eq!(run(&mut rt, "(let ((x -2147483648)) (decf x))"), "-2.14748e9");
        assert_eq!(run(&mut rt, "(let ((x 1.5)) (decf x))"), "0.5");
        assert_eq!(run(&mut rt, "(let ((x 1)) (incf x 0.5))"), "1.5");
        assert_eq!(run(&mut rt, "(let ((l (list 1 2))) (incf (car l)) l)"), "(2 2)");
        assert_eq!(run(&mut rt, "(let ((l (list 1 2))) (setf (cdr l) 3) l)"), "(1 . 3)");
        assert_eq!(
            fail(&mut rt, "(let ((x 'a)) (incf x))"),
            "'incf' argument is not a number"
        );
        assert_eq!(fail(&mut rt, "(setf (car nil) 1)"), "'setf' can't take car: nil");
    }

    #[test]
    fn conditionals() {
        let (mut rt, _) = quiet();

        assert_eq!(run(&mut rt, "(if t 1 2)"), "1");
        assert_eq!(run(&mut rt, "(if nil 1)"), "nil");
        assert_eq!(run(&mut rt, "(cond ((= 1 2) 'a) ((+ 1 1)))"), "2");
        assert_eq!(run(&mut rt, "(cond (nil 1))"), "nil");
        assert_eq!(run(&mut rt, "(when 1 2 3)"), "3");
        assert_eq!(run(&mut rt, "(unless 1 2)"), "nil");
        assert_eq!(
            run(&mut rt, "(case 3 ((1 2) 'low) (3 'three) (t 'other))"),
            "three"
        );
        assert_eq!(run(&mut rt, "(case 9 ((1 2) 'low) (t 'other))"), "other");
        assert_eq!(run(&mut rt, "(and 1 2)"), "2");
        assert_eq!(run(&mut rt, "(and 1 nil 2)"), "nil");
        assert_eq!(run(&mut rt, "(and)"), "t");
        assert_eq!(run(&mut rt, "(or nil 3)"), "3");
        assert_eq!(run(&mut rt, "(or (+ 1 1) 3)"), "2");
        assert_eq!(run(&mut rt, "(or)"), "nil");
        assert_eq!(run(&mut rt, "(progn)"), "nil");
        assert_eq!(fail(&mut rt, "(if)"), "'if' has too few arguments");
        assert_eq!(fail(&mut rt, "(if 1 2 3 4)"), "'if' has too many arguments");
        assert_eq!(fail(&mut rt, "(cond 5)"), "'cond' illegal clause: 5");
    }

    #[test]
    fn tracing() {
        let (mut rt, out) = quiet();

        run(&mut rt, "(defun sq (x) (* x x))");
        assert_eq!(run(&mut rt, "(trace sq)"), "(sq)");
        assert_eq!(run(&mut rt, "(sq 3)"), "9");
        assert_eq!(&*out.borrow(), b"0: (sq 3)\n0: sq returned 9\n");

        assert_eq!(fail(&mut rt, "(trace sq)"), "'trace' already being traced: sq");
        assert_eq!(run(&mut rt, "(untrace sq)"), "(sq)");
        assert_eq!(fail(&mut rt, "(untrace sq)"), "'untrace' not tracing: sq");

        out.borrow_mut().clear();
        run(&mut rt, "(defun fact (n) (if (<= n 1) 1 (* n (fact (- n 1)))))");
        run(&mut rt, "(trace fact)");
        assert_eq!(run(&mut rt, "(fact 2)"), "2");
        assert_eq!(
            String::from_utf8(out.borrow().clone()).unwrap(),
            "0: (fact 2)\n  1: (fact 1)\n  1: fact returned 1\n0: fact returned 2\n"
        );
        assert_eq!(run(&mut rt, "(untrace)"), "(fact)");
        assert_eq!(run(&mut rt, "(untrace)"), "nil");
    }

    #[test]
    fn trace_limit() {
        let (mut rt, _) = quiet();

        assert_eq!(run(&mut rt, "(trace a) (trace b) (trace c)"), "(c b a)");
        assert_eq!(fail(&mut rt, "(trace d)"), "'trace' already tracing 3 functions");
    }

    #[test]
    fn waits() {
        let (mut rt, _) = quiet();

        let elapsed: i32 = run(&mut rt, "(for-millis (5))").parse().unwrap();
        assert!(elapsed >= 5);
        let elapsed: i32 = run(&mut rt, "(for-millis () 1)").parse().unwrap();
        assert!(elapsed >= 0);
    }

    #[test]
    fn devices() {
        let (mut rt, _) = quiet();

        // nothing serves these addresses
        assert_eq!(run(&mut rt, "(with-i2c (s #x70) s)"), "nil");
        assert_eq!(run(&mut rt, "(with-spi (s 5 4000 1 0) s)"), "nil");
        assert_eq!(fail(&mut rt, "(with-spi (s))"), "'with-spi' missing stream argument");

        let (port, written) = BufferPort::new(b"");
        rt.register_port(Kind::I2c, 0x70, Box::new(port));
        assert_eq!(
            run(&mut rt, "(with-i2c (s #x70) (write-byte 7 s) s)"),
            "<i2c-stream 112>"
        );
        assert_eq!(&*written.borrow(), &[7]);
        assert_eq!(run(&mut rt, "(with-serial (s 0 9600) s)"), "<serial-stream 0>");
    }

    #[test]
    fn files() {
        let dir = std::env::temp_dir().join(format!("kestrel-forms-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let (console, _) = BufferPort::new(b"");
        let config = Config {
            load_library: false,
            storage: dir.clone(),
            ..Config::default()
        };
        let mut rt = Runtime::with_console(config, Box::new(console)).unwrap();

        run(&mut rt, "(with-sd-card (s \"t.txt\" 2) (princ \"abc\" s))");
        assert_eq!(run(&mut rt, "(with-sd-card (s \"t.txt\") (read-line s))"), "\"abc\"");
        run(&mut rt, "(with-sd-card (s \"t.txt\" 1) (princ \"de\" s))");
        assert_eq!(run(&mut rt, "(with-sd-card (s \"t.txt\") s)"), "<sd-stream 1>");
        assert_eq!(run(&mut rt, "(with-spiffs (s \"t.txt\") (read-line s))"), "\"abcde\"");

        assert_eq!(
            fail(&mut rt, "(with-sd-card (s \"missing.txt\") 1)"),
            "'with-sd-card' problem reading from SD card"
        );
        assert_eq!(
            fail(&mut rt, "(with-spiffs (s \"missing.txt\") 1)"),
            "'with-spiffs' problem reading from SPIFFS"
        );
        assert_eq!(
            fail(&mut rt, "(with-sd-card (s 12) 1)"),
            "'with-sd-card' argument is not a string: 12"
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
