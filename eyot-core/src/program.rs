#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use eyot_ast::{Errors, FunctionGroup, Module, ModuleId, Scope, Tle, Type};
use eyot_lex::tokenize;
use eyot_parse::{ModuleProvider, Parser};

use crate::context::{Context, ModuleFunctions, Pass, StringPool};
use crate::env::Environment;
use crate::ffi::ffi_beside;
use crate::tle::check_module_elements;

/// The whole-program aggregate: every parsed module plus the merged
/// registry, string pool, vector instantiations, GPU flag and the
/// maximum observed closure size. Written by the analyzer, read by the
/// emitter once the last pass finishes.
pub struct Program {
    pub gpu_required: bool,
    pub max_closure_size: usize,
    pub functions: FunctionGroup,
    pub env: Environment,
    pub root_module_id: ModuleId,
    pub strings: StringPool,
    /// Vector element types observed anywhere, keyed by raw identifier.
    pub vectors: BTreeMap<String, Type>,

    modules: Vec<Rc<RefCell<Module>>>,
    module_index: HashMap<String, usize>,
}

impl Program {
    pub fn new(env: Environment) -> Program {
        Program {
            gpu_required: false,
            max_closure_size: 0,
            functions: FunctionGroup::new(),
            env,
            root_module_id: ModuleId::default(),
            strings: StringPool::new(),
            vectors: BTreeMap::new(),
            modules: Vec::new(),
            module_index: HashMap::new(),
        }
    }

    /// Modules in insertion order; the emitter iterates this.
    pub fn modules(&self) -> &[Rc<RefCell<Module>>] {
        &self.modules
    }

    /// The deduplicated linker flags requested by FFI descriptors.
    pub fn ffi_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = Vec::new();
        for module in &self.modules {
            let m = module.borrow();
            if let Some(ffi) = &m.ffi {
                for flag in &ffi.linker_flags {
                    if !flags.contains(flag) {
                        flags.push(flag.clone());
                    }
                }
            }
        }
        flags
    }

    /// The raw C sources supplied by FFI descriptors.
    pub fn ffi_sources(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter_map(|m| m.borrow().ffi.as_ref().map(|f| f.src.clone()))
            .collect()
    }

    fn inner_parse(
        &mut self,
        id: &ModuleId,
        disallowed: &HashSet<String>,
        errors: &mut Errors,
    ) -> Option<Rc<RefCell<Module>>> {
        let path = self.env.find_module(id)?;

        let ffi = match ffi_beside(&path) {
            Ok(ffi) => ffi,
            Err(e) => {
                errors.log_internal(format!(
                    "Failed to load ffi information beside {}: {e}",
                    path.display()
                ));
                return None;
            }
        };

        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => {
                errors.log_internal(format!("Failed to read file {}", path.display()));
                return None;
            }
        };

        let tokens = match tokenize(&source) {
            Ok(tokens) => tokens,
            Err(e) => {
                errors.log_internal(format!("Tokenise failed with error: {}", e.message));
                return None;
            }
        };

        let parser = Parser::new(
            Some(self),
            id.clone(),
            &tokens,
            errors,
            disallowed.clone(),
            ffi,
        );
        let module = parser.module()?;
        if !errors.clean() {
            return None;
        }

        let module = Rc::new(RefCell::new(module));
        self.module_index.insert(id.key(), self.modules.len());
        self.modules.push(module.clone());
        Some(module)
    }

    /// Parse and analyze the root module, then confirm the entry point.
    pub fn parse_root(&mut self, module_name: &str, errors: &mut Errors) {
        self.root_module_id = ModuleId::single(module_name);
        let id = self.root_module_id.clone();

        let Some(root) = self.inner_parse(&id, &HashSet::new(), errors) else {
            if errors.clean() {
                errors.report("file not found");
            }
            return;
        };
        if !errors.clean() {
            return;
        }

        self.check_module(&root, errors);
        if !errors.clean() {
            return;
        }

        let main = root.borrow().function_info("main");
        match main {
            None => errors.report("No main function found"),
            Some(info) => {
                if let Type::Function(ft) = &info.ty {
                    if !ft.params.is_empty() {
                        errors.report(format!(
                            "Main function ({}) should not take arguments",
                            info.id
                        ));
                    }
                }
            }
        }
    }

    /// Run the three analysis passes over one module and fold its
    /// contribution into the program aggregate.
    pub fn check_module(&mut self, module: &Rc<RefCell<Module>>, errors: &mut Errors) {
        let module_id = module.borrow().id.clone();
        let module_scope = module.borrow().scope.clone();
        hoist_function_declarations(module, &module_scope);

        let mut pool = std::mem::take(&mut self.strings);

        let (gpu, functions, max_closure) = {
            let mut ctx = Context::new(errors, &mut pool);

            ctx.errors.set_activity("Set types");
            ctx.prepare_for_pass(
                Pass::SetTypes,
                module_id.clone(),
                module_function_snapshot(module),
            );
            check_module_elements(module, &mut ctx);

            // Attach the instantiations this module owns; tuples and
            // structs observed here drive the emitter's typedefs.
            {
                let mut m = module.borrow_mut();
                for required in ctx.take_structs() {
                    if required.id.module == m.id {
                        m.structs.push(required);
                    }
                }
            }
            for (key, ty) in ctx.take_vectors() {
                self.vectors.insert(key, ty);
            }

            if ctx.errors.clean() {
                ctx.errors.set_activity("Mutate tree");
                ctx.prepare_for_pass(
                    Pass::Mutate,
                    module_id.clone(),
                    module_function_snapshot(module),
                );
                check_module_elements(module, &mut ctx);
            }

            if ctx.errors.clean() {
                ctx.errors.set_activity("Check types");
                ctx.prepare_for_pass(
                    Pass::CheckTypes,
                    module_id,
                    module_function_snapshot(module),
                );
                check_module_elements(module, &mut ctx);
            }

            ctx.errors.set_activity("");
            ctx.finish()
        };

        self.strings = pool;

        if gpu {
            self.gpu_required = true;
        }
        self.functions.merge_in(functions);
        if max_closure > self.max_closure_size {
            self.max_closure_size = max_closure;
        }
    }
}

impl ModuleProvider for Program {
    fn get_module(
        &mut self,
        id: &ModuleId,
        disallowed: &HashSet<String>,
        errors: &mut Errors,
    ) -> Option<Rc<RefCell<Module>>> {
        if let Some(&index) = self.module_index.get(&id.key()) {
            return Some(self.modules[index].clone());
        }

        let mut next_disallowed = disallowed.clone();
        next_disallowed.insert(id.key());

        let module = self.inner_parse(id, &next_disallowed, errors)?;
        self.check_module(&module, errors);
        Some(module)
    }
}

/// Bind every top-level function name into the module scope before the
/// first pass so forward references resolve.
fn hoist_function_declarations(module: &Rc<RefCell<Module>>, scope: &Scope) {
    let m = module.borrow();
    for tlec in &m.elements {
        if let Tle::Function(fd) = &tlec.element {
            if fd.id.struct_id.is_blank() {
                scope.set_variable(&fd.id.name, fd.our_type(), false);
            }
        }
    }
}

/// Name-to-id map of the module's free functions, used by the mutation
/// pass to resolve call targets.
fn module_function_snapshot(module: &Rc<RefCell<Module>>) -> ModuleFunctions {
    let mut functions = ModuleFunctions::default();
    let m = module.borrow();
    for tlec in &m.elements {
        if let Tle::Function(fd) = &tlec.element {
            if fd.id.struct_id.is_blank() {
                functions.insert(fd.id.name.clone(), fd.id.clone());
            }
        }
    }
    functions
}
