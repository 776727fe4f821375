//! The single-pass compile-time state machine.
//!
//! `Compiler` drives the lexer, resolves names against the dictionary,
//! and writes bytes into a `Vm` it uses purely as an addressable scratch
//! buffer ("assembler sandbox") — nothing it writes is ever executed
//! until the finished image is loaded into a fresh `Vm` later.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use arkam_vm::{Cell, Opcode, StepStatus, Vm, VmOptions, CELL_SIZE, HEADER_ENTRY, HEADER_HERE, PRIMITIVE_NAMES};

use crate::dict::{Dictionary, EntryId, EntryKind};
use crate::error::CompileError;
use crate::lexer::{Lexer, TokenKind};

fn parse_number(token: &str) -> Option<Cell> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return i32::from_str_radix(hex, 16).ok();
    }
    token.parse::<Cell>().ok()
}

pub struct Compiler {
    vm: Vm,
    here: Cell,
    dict: Dictionary,
    current: Option<EntryId>,
    back_stack: Vec<Cell>,
    lexer: Lexer,
    search_path: Vec<PathBuf>,
    compiled: HashSet<PathBuf>,
    in_progress: Vec<PathBuf>,
    frame_records: Vec<Option<PathBuf>>,
}

impl Compiler {
    #[must_use]
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        let vm = Vm::new(VmOptions::default());
        Self {
            here: arkam_vm::HEADER_CODE_BEGIN,
            vm,
            dict: Dictionary::new(),
            current: None,
            back_stack: Vec::new(),
            lexer: Lexer::new(),
            search_path,
            compiled: HashSet::new(),
            in_progress: Vec::new(),
            frame_records: Vec::new(),
        }
    }

    /// Compile the embedded core library, which only adds the
    /// conventional symbolic aliases (`+`, `-`, `=`, ...) over the
    /// primitive table.
    pub fn compile_corelib(&mut self) -> Result<(), CompileError> {
        self.lexer.push_source("<corelib>".to_string(), include_str!("../assets/core.sol"));
        self.frame_records.push(None);
        self.run()
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<(), CompileError> {
        let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.compiled.contains(&canon) {
            return Ok(());
        }
        let text = std::fs::read_to_string(&canon)
            .map_err(|e| CompileError::new(path.display().to_string(), 0, 0, format!("cannot read {}: {e}", path.display())))?;
        self.in_progress.push(canon.clone());
        self.frame_records.push(Some(canon));
        self.lexer.push_source(path.display().to_string(), &text);
        self.run()
    }

    fn run(&mut self) -> Result<(), CompileError> {
        while let Some(tok) = self.lexer.next_token()? {
            let (file, line, col) = (tok.file.clone(), tok.line, tok.col);
            match tok.kind {
                TokenKind::Str(s) => self.emit_string_literal(&s, &file, line, col)?,
                TokenKind::Word(w) => self.process_word(&w, &file, line, col)?,
            }
            while self.frame_records.len() > self.lexer.depth() {
                if let Some(Some(p)) = self.frame_records.pop() {
                    self.in_progress.retain(|x| x != &p);
                    self.compiled.insert(p);
                }
            }
        }
        Ok(())
    }

    // ----- emission helpers -------------------------------------------

    fn emit(&mut self, value: Cell) -> Result<(), CompileError> {
        self.vm
            .write_cell(self.here, value)
            .map_err(|e| CompileError::new("<compile>", 0, 0, e.to_string()))?;
        self.here += CELL_SIZE;
        Ok(())
    }

    fn emit_byte(&mut self, value: u8) -> Result<(), CompileError> {
        self.vm
            .write_byte(self.here, value)
            .map_err(|e| CompileError::new("<compile>", 0, 0, e.to_string()))?;
        self.here += 1;
        Ok(())
    }

    fn align(&mut self) {
        while self.here % CELL_SIZE != 0 {
            self.here += 1;
        }
    }

    fn backpatch(&mut self, site: Cell, target: Cell) -> Result<(), CompileError> {
        self.vm
            .write_cell(site, target)
            .map_err(|e| CompileError::new("<compile>", 0, 0, e.to_string()))
    }

    /// Run the bytes just compiled in `[start, self.here)` to completion
    /// on the sandbox VM. Outside any word definition, a statement is not
    /// reachable from `main`'s call graph, so it is executed right away
    /// instead — the usual top-level "interpret, don't compile" behavior
    /// of a Forth-family system, here implemented by single-stepping the
    /// same VM the compiler already uses as its scratch buffer.
    fn interpret_toplevel(&mut self, start: Cell, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let target = self.here;
        let saved_ip = self.vm.ip;
        self.vm.ip = start;
        while self.vm.ip != target {
            match self.vm.step() {
                StepStatus::Continue => {}
                StepStatus::Halt => break,
                StepStatus::Fault(e) => {
                    self.vm.ip = saved_ip;
                    return Err(CompileError::new(file, line, col, format!("{e}")));
                }
            }
        }
        self.vm.ip = saved_ip;
        Ok(())
    }

    // ----- token-level helpers -----------------------------------------

    fn expect_word_token(&mut self, file: &str, line: u32, col: u32) -> Result<String, CompileError> {
        match self.lexer.next_token()? {
            Some(tok) => match tok.kind {
                TokenKind::Word(w) => Ok(w),
                TokenKind::Str(_) => Err(CompileError::new(file, line, col, "Word name required")),
            },
            None => Err(CompileError::new(file, line, col, "Word name required")),
        }
    }

    fn expect_string_token(&mut self, file: &str, line: u32, col: u32) -> Result<String, CompileError> {
        match self.lexer.next_token()? {
            Some(tok) => match tok.kind {
                TokenKind::Str(s) => Ok(s),
                TokenKind::Word(_) => Err(CompileError::new(file, line, col, "Unknown token")),
            },
            None => Err(CompileError::new(file, line, col, "Unknown token")),
        }
    }

    // ----- string literals -----------------------------------------------

    fn emit_string_literal(&mut self, s: &str, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let stmt_start = self.here;
        self.emit(Opcode::Jmp.encode())?;
        let skip_site = self.here;
        self.emit(0)?;
        let start = self.here;
        for b in s.bytes() {
            self.emit_byte(b)?;
        }
        self.emit_byte(0)?;
        self.align();
        self.backpatch(skip_site, self.here)?;
        self.emit(Opcode::Lit.encode())?;
        self.emit(start)?;
        if self.current.is_none() {
            self.interpret_toplevel(stmt_start, file, line, col)?;
        }
        Ok(())
    }

    // ----- defining words ------------------------------------------------

    fn process_word(&mut self, w: &str, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        match w {
            ":" => self.begin_word(file, line, col),
            ";" => self.end_word(file, line, col),
            "const:" => self.define_const(file, line, col),
            "val:" => self.define_value(file, line, col),
            "IF" => self.do_if(file, line, col),
            "ELSE" => self.do_else(file, line, col),
            "END" => self.do_end(file, line, col),
            "AGAIN" => self.do_again(file, line, col),
            "RECUR" => self.do_recur(file, line, col),
            "[" => self.open_quotation(file, line, col),
            "]" => self.close_quotation(file, line, col),
            "&" => self.emit_address_of(file, line, col),
            "include:" => self.do_include(file, line, col),
            "datafile:" => self.do_datafile(file, line, col),
            _ => self.compile_reference(w, file, line, col),
        }
    }

    fn begin_word(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let name = self.expect_word_token(file, line, col)?;
        if let Some(cur) = self.current {
            let entry = self.dict.get(cur);
            if entry.kind == EntryKind::Quotation {
                return Err(CompileError::new(file, line, col, "Do not create nested word in quotation"));
            }
            if self.here != entry.inst {
                return Err(CompileError::new(
                    file,
                    line,
                    col,
                    format!("Nested word {name} is not at first of parent definition"),
                ));
            }
        }
        let id = self.dict.define(self.current, name, EntryKind::User, self.here);
        self.current = Some(id);
        Ok(())
    }

    fn end_word(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        match self.current {
            Some(id) if self.dict.get(id).kind == EntryKind::User => {
                self.emit(Opcode::Ret.encode())?;
                let parent = self.dict.get(id).parent;
                if let Some(p) = parent {
                    self.dict.get_mut(p).inst = self.here;
                }
                self.current = parent;
                Ok(())
            }
            _ => Err(CompileError::new(file, line, col, "Semicolon out of word definition")),
        }
    }

    fn define_const(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let name = self.expect_word_token(file, line, col)?;
        let value_tok = self.expect_word_token(file, line, col)?;
        let value = self.resolve_const_value(&value_tok, file, line, col)?;
        self.dict.define(self.current, name, EntryKind::Constant(value), value);
        Ok(())
    }

    fn resolve_const_value(&self, token: &str, file: &str, line: u32, col: u32) -> Result<Cell, CompileError> {
        if let Some(n) = parse_number(token) {
            return Ok(n);
        }
        if let Some(id) = self.dict.resolve(self.current, token) {
            if let EntryKind::Constant(v) = self.dict.get(id).kind {
                return Ok(v);
            }
        }
        Err(CompileError::new(file, line, col, "Constant value should be number or constant"))
    }

    fn define_value(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let name = self.expect_word_token(file, line, col)?;

        // The storage cell is allocated right away rather than at link
        // time: a bare value can be set from top level in the same
        // breath it's declared (`val: x  42 x!`), and the setter has to
        // have a real address to write through the moment it runs.
        let storage_addr = self.here;
        self.emit(0)?;

        let getter_addr = self.here;
        self.emit(Opcode::Lit.encode())?;
        self.emit(storage_addr)?;
        self.emit(Opcode::Get.encode())?;
        self.emit(Opcode::Ret.encode())?;
        self.dict.define(self.current, name.clone(), EntryKind::Value(storage_addr), getter_addr);

        let setter_addr = self.here;
        self.emit(Opcode::Lit.encode())?;
        self.emit(storage_addr)?;
        self.emit(Opcode::Set.encode())?;
        self.emit(Opcode::Ret.encode())?;
        self.dict.define(self.current, format!("{name}!"), EntryKind::Value(storage_addr), setter_addr);
        Ok(())
    }

    fn do_if(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        if self.current.is_none() {
            return Err(CompileError::new(file, line, col, "IF out of definition"));
        }
        self.emit(Opcode::Zjmp.encode())?;
        let site = self.here;
        self.emit(0)?;
        self.back_stack.push(site);
        Ok(())
    }

    fn do_else(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let if_site = self
            .back_stack
            .pop()
            .ok_or_else(|| CompileError::new(file, line, col, "ELSE out of place"))?;
        self.emit(Opcode::Jmp.encode())?;
        let else_site = self.here;
        self.emit(0)?;
        self.backpatch(if_site, self.here)?;
        self.back_stack.push(else_site);
        Ok(())
    }

    fn do_end(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let site = self
            .back_stack
            .pop()
            .ok_or_else(|| CompileError::new(file, line, col, "END out of place"))?;
        self.backpatch(site, self.here)
    }

    fn do_again(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let cur = self
            .current
            .ok_or_else(|| CompileError::new(file, line, col, "AGAIN out of definition"))?;
        let target = self.dict.get(cur).inst;
        self.emit(Opcode::Jmp.encode())?;
        self.emit(target)
    }

    fn do_recur(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let cur = self
            .current
            .ok_or_else(|| CompileError::new(file, line, col, "RECUR out of definition"))?;
        let target = self.dict.get(cur).inst;
        self.emit(target)
    }

    fn open_quotation(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        if self.current.is_none() {
            return Err(CompileError::new(file, line, col, "Quotation out of definition"));
        }
        self.emit(Opcode::Jmp.encode())?;
        let skip_site = self.here;
        self.emit(0)?;
        let body_start = self.here;
        let id = self.dict.define(self.current, String::new(), EntryKind::Quotation, body_start);
        self.dict.get_mut(id).back = skip_site;
        self.current = Some(id);
        Ok(())
    }

    fn close_quotation(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let id = match self.current {
            Some(id) if self.dict.get(id).kind == EntryKind::Quotation => id,
            _ => return Err(CompileError::new(file, line, col, "Close quot out of quotation")),
        };
        self.emit(Opcode::Ret.encode())?;
        let skip_site = self.dict.get(id).back;
        self.backpatch(skip_site, self.here)?;
        let body_addr = self.dict.get(id).inst;
        self.emit(Opcode::Lit.encode())?;
        self.emit(body_addr)?;
        let parent = self.dict.get(id).parent;
        self.dict.free_quotation(id);
        self.current = parent;
        Ok(())
    }

    fn emit_address_of(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let start = self.here;
        let name = self.expect_word_token(file, line, col)?;
        let id = self
            .dict
            .resolve(self.current, &name)
            .ok_or_else(|| CompileError::new(file, line, col, format!("Unknown token: {name}")))?;
        match self.dict.get(id).kind {
            EntryKind::Constant(_) => {
                return Err(CompileError::new(
                    file,
                    line,
                    col,
                    format!("Word {name} is a constant. Do not use & for it."),
                ))
            }
            EntryKind::Value(addr) => {
                self.emit(Opcode::Lit.encode())?;
                self.emit(addr)?;
            }
            EntryKind::User | EntryKind::Quotation => {
                let addr = self.dict.get(id).inst;
                self.emit(Opcode::Lit.encode())?;
                self.emit(addr)?;
            }
        }
        if self.current.is_none() {
            self.interpret_toplevel(start, file, line, col)?;
        }
        Ok(())
    }

    fn compile_reference(&mut self, w: &str, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let start = self.here;
        if let Some(id) = self.dict.resolve(self.current, w) {
            match self.dict.get(id).kind {
                EntryKind::Constant(v) => {
                    self.emit(Opcode::Lit.encode())?;
                    self.emit(v)?;
                }
                EntryKind::User | EntryKind::Value(_) => {
                    let addr = self.dict.get(id).inst;
                    self.emit(addr)?;
                }
                EntryKind::Quotation => unreachable!("quotations are never resolved by name"),
            }
        } else if let Some((_, op)) = PRIMITIVE_NAMES.iter().find(|(name, _)| *name == w) {
            self.emit(op.encode())?;
        } else if let Some(n) = parse_number(w) {
            self.emit(Opcode::Lit.encode())?;
            self.emit(n)?;
        } else {
            return Err(CompileError::new(file, line, col, format!("Unknown token: {w}")));
        }
        if self.current.is_none() {
            self.interpret_toplevel(start, file, line, col)?;
        }
        Ok(())
    }

    // ----- include: / datafile: ------------------------------------------

    fn resolve_include_path(&self, rel: &str, including_file: &str) -> Option<PathBuf> {
        let including_dir = Path::new(including_file).parent().map(Path::to_path_buf).unwrap_or_default();
        let candidate = including_dir.join(rel);
        if candidate.exists() {
            return Some(candidate);
        }
        for dir in &self.search_path {
            let candidate = dir.join(rel);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn push_file_source(&mut self, path: &Path, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.compiled.contains(&canon) {
            return Ok(());
        }
        if let Some(other) = self.in_progress.iter().find(|p| **p == canon) {
            return Err(CompileError::new(
                file,
                line,
                col,
                format!("Circular include detected on {} and {}", other.display(), canon.display()),
            ));
        }
        let text = std::fs::read_to_string(&canon)
            .map_err(|_| CompileError::new(file, line, col, format!("include not found: {}", path.display())))?;
        self.in_progress.push(canon.clone());
        self.frame_records.push(Some(canon));
        self.lexer.push_source(path.display().to_string(), &text);
        Ok(())
    }

    fn do_include(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        let rel = self.expect_string_token(file, line, col)?;
        let resolved = self
            .resolve_include_path(&rel, file)
            .ok_or_else(|| CompileError::new(file, line, col, format!("include not found: {rel}")))?;
        self.push_file_source(&resolved, file, line, col)
    }

    fn do_datafile(&mut self, file: &str, line: u32, col: u32) -> Result<(), CompileError> {
        if self.here % CELL_SIZE != 0 {
            return Err(CompileError::new(file, line, col, "datafile: not aligned before"));
        }
        let name = self.expect_word_token(file, line, col)?;
        let rel = self.expect_string_token(file, line, col)?;
        let resolved = self
            .resolve_include_path(&rel, file)
            .unwrap_or_else(|| PathBuf::from(&rel));
        let bytes = std::fs::read(&resolved)
            .map_err(|_| CompileError::new(file, line, col, format!("include not found: {rel}")))?;

        let const_addr = self.here;
        self.dict.define(self.current, name, EntryKind::Constant(const_addr), const_addr);
        let size_site = self.here;
        self.emit(0)?;
        for b in &bytes {
            self.emit_byte(*b)?;
        }
        self.align();
        self.backpatch(size_site, bytes.len() as Cell)
    }

    // ----- finalization ----------------------------------------------------

    /// Require `main`, emit the startup trampoline, and write the
    /// finished image to `output`.
    pub fn finalize(mut self, output: &Path) -> Result<(), CompileError> {
        let main_id = self
            .dict
            .resolve(None, "main")
            .filter(|&id| self.dict.get(id).kind == EntryKind::User)
            .ok_or_else(|| CompileError::new(self.lexer.current_file().unwrap_or("<eof>").to_string(), 0, 0, "No main entrypoint"))?;
        let main_addr = self.dict.get(main_id).inst;

        self.align();
        let trampoline_addr = self.here;
        self.emit(Opcode::Lit.encode())?;
        self.emit(0)?;
        self.emit(main_addr)?;
        self.emit(Opcode::Halt.encode())?;

        let final_here = self.here;
        self.backpatch(HEADER_ENTRY, trampoline_addr)?;
        self.backpatch(HEADER_HERE, final_here)?;

        let bytes = self.vm.image_bytes(final_here);
        std::fs::write(output, bytes)
            .map_err(|e| CompileError::new(output.display().to_string(), 0, 0, format!("cannot write {}: {e}", output.display())))?;
        Ok(())
    }
}
