#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use eyot_ast::{
    CFunction, Errors, FunctionGroup, FunctionId, ModuleId, RequiredStruct, Scope, Stmt,
    StructField, StructId, StructLayout, Tle, Type,
};

/// The three ordered analysis passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Populate cached types, resolve identifiers, record required
    /// instantiations, gate locus-restricted constructs.
    SetTypes,
    /// Rewrite the tree into the form the emitter processes mechanically.
    Mutate,
    /// Validate everything the earlier passes assumed.
    CheckTypes,
}

/// Program-wide string literal pool; ids are first-seen order.
#[derive(Debug, Default)]
pub struct StringPool {
    ids: HashMap<String, usize>,
    order: Vec<String>,
}

impl StringPool {
    pub fn new() -> StringPool {
        StringPool::default()
    }

    pub fn id_for(&mut self, s: &str) -> usize {
        if let Some(id) = self.ids.get(s) {
            return *id;
        }
        let id = self.order.len();
        self.ids.insert(s.to_string(), id);
        self.order.push(s.to_string());
        id
    }

    pub fn entries(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What a module's analysis knows about its own top-level functions,
/// snapshotted so identifier resolution does not re-walk the tree.
pub type ModuleFunctions = HashMap<String, FunctionId>;

/// The mutable record of one module's analysis: the current pass, the
/// accumulated requirements, and the statement/element insertion buffers
/// the mutation pass splices through.
pub struct Context<'a> {
    pub pass: Pass,
    pub errors: &'a mut Errors,
    pub functions: FunctionGroup,

    structs: Vec<RequiredStruct>,
    vectors: BTreeMap<String, Type>,
    insert_stmts: Vec<Vec<Stmt>>,
    insert_tles: Vec<Tle>,
    return_types: Vec<Type>,
    temp_count: usize,
    should_remove: bool,
    max_closure_size: usize,
    cpu_depth: i32,
    gpu_depth: i32,
    gpu_required: bool,
    strings: &'a mut StringPool,
    module_id: ModuleId,
    module_functions: ModuleFunctions,
}

impl<'a> Context<'a> {
    pub fn new(errors: &'a mut Errors, strings: &'a mut StringPool) -> Context<'a> {
        Context {
            pass: Pass::SetTypes,
            errors,
            functions: FunctionGroup::new(),
            structs: Vec::new(),
            vectors: BTreeMap::new(),
            insert_stmts: Vec::new(),
            insert_tles: Vec::new(),
            return_types: Vec::new(),
            temp_count: 0,
            should_remove: false,
            max_closure_size: 0,
            cpu_depth: 0,
            gpu_depth: 0,
            gpu_required: false,
            strings,
            module_id: ModuleId::default(),
            module_functions: ModuleFunctions::default(),
        }
    }

    /// Reset the per-pass requirement collections and enter `pass`.
    pub fn prepare_for_pass(
        &mut self,
        pass: Pass,
        module_id: ModuleId,
        module_functions: ModuleFunctions,
    ) {
        self.pass = pass;
        self.structs.clear();
        self.vectors.clear();
        self.module_id = module_id;
        self.module_functions = module_functions;
    }

    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    pub fn lookup_module_function(&self, name: &str) -> Option<FunctionId> {
        self.module_functions.get(name).cloned()
    }

    pub fn string_id(&mut self, s: &str) -> usize {
        self.strings.id_for(s)
    }

    pub fn take_structs(&mut self) -> Vec<RequiredStruct> {
        std::mem::take(&mut self.structs)
    }

    pub fn take_vectors(&mut self) -> BTreeMap<String, Type> {
        std::mem::take(&mut self.vectors)
    }

    pub fn require_closure_size(&mut self, size: usize) {
        if size > self.max_closure_size {
            self.max_closure_size = size;
        }
    }

    pub fn gpu_required(&self) -> bool {
        self.gpu_required
    }

    pub fn set_gpu_required(&mut self) {
        self.gpu_required = true;
    }

    pub fn unique_id(&mut self) -> usize {
        self.temp_count += 1;
        self.temp_count
    }

    pub fn temp_name(&mut self) -> String {
        format!("ey_temp_{}", self.unique_id())
    }

    fn validate_locus_depths(&mut self) {
        if self.cpu_depth < 0 || self.gpu_depth < 0 {
            self.errors.log_internal("locus depth underflow in analyzer");
        }
        if self.cpu_depth > 0 && self.gpu_depth > 0 {
            self.errors
                .log_internal("analyzer entered cpu and gpu contexts simultaneously");
        }
    }

    pub fn enter_cpu(&mut self) {
        self.cpu_depth += 1;
    }

    pub fn leave_cpu(&mut self) {
        self.cpu_depth -= 1;
        self.validate_locus_depths();
    }

    pub fn enter_gpu(&mut self) {
        self.gpu_depth += 1;
    }

    pub fn leave_gpu(&mut self) {
        self.gpu_depth -= 1;
        self.validate_locus_depths();
    }

    /// Record that the current statement needs the CPU; errors unless the
    /// analysis is inside a CPU-capable function.
    pub fn note_cpu_required(&mut self, what: &str) {
        if self.cpu_depth == 0 {
            self.errors
                .report(format!("CPU is required for this statement: {what}"));
        }
    }

    /// As `note_cpu_required`, for GPU-only constructs.
    pub fn note_gpu_required(&mut self, what: &str) {
        if self.gpu_depth == 0 {
            self.errors
                .report(format!("GPU is required for this statement: {what}"));
        }
    }

    pub fn current_return_type(&self) -> Option<Type> {
        self.return_types.last().cloned()
    }

    pub fn push_return_type(&mut self, ty: Type) {
        self.return_types.push(ty);
    }

    pub fn pop_return_type(&mut self) {
        self.return_types.pop();
    }

    /// Queue a statement to be spliced in front of the one currently
    /// being analyzed.
    pub fn insert_statement_before(&mut self, stmt: Stmt) {
        if let Some(buffer) = self.insert_stmts.last_mut() {
            buffer.push(stmt);
        }
    }

    /// Queue a top-level element to be spliced in front of the one
    /// currently being analyzed.
    pub fn insert_element_before(&mut self, tle: Tle) {
        self.insert_tles.push(tle);
    }

    /// Drop the statement currently being analyzed once its check ends.
    pub fn remove_this_statement(&mut self) {
        self.should_remove = true;
    }

    /// True once (and cleared) when the current statement should go.
    pub fn should_remove_statement(&mut self) -> bool {
        std::mem::take(&mut self.should_remove)
    }

    pub fn start_statement_collection(&mut self) {
        self.insert_stmts.push(Vec::new());
    }

    pub fn stop_statement_collection(&mut self) -> Vec<Stmt> {
        self.insert_stmts.pop().unwrap_or_default()
    }

    pub fn elements_for_insert(&mut self) -> Vec<Tle> {
        std::mem::take(&mut self.insert_tles)
    }

    pub fn assert_integer(&mut self, ty: &Type) {
        if *ty != Type::Integer {
            self.errors
                .report(format!("Mismatched types: expecting integer, got {ty}"));
        }
    }

    /// Note a type the emitter must be able to produce. First use of a
    /// tuple type synthesizes an anonymous carrier struct; 64-bit floats
    /// are gated to CPU contexts.
    pub fn require_type(&mut self, ty: &Type, scope: &Scope) {
        if let Type::Float { width } = ty {
            if *width != 32 {
                self.note_cpu_required("64 bit float");
            }
        }

        match ty {
            Type::Tuple(items) => {
                let type_id = ty.tuple_identifier();
                if self.structs.iter().any(|rs| rs.type_id == type_id) {
                    return;
                }

                let layout = StructLayout {
                    fields: items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| StructField {
                            name: tuple_field_name(i),
                            ty: item.clone(),
                        })
                        .collect(),
                    methods: Vec::new(),
                };

                self.structs.push(RequiredStruct {
                    generated_for_tuple: true,
                    type_id: type_id.clone(),
                    id: StructId::new(self.module_id.clone(), type_id),
                    layout,
                });
            }

            Type::Struct(sid) => {
                let type_id = ty.tuple_identifier();
                if self.structs.iter().any(|rs| rs.type_id == type_id) {
                    return;
                }

                match scope.lookup_struct(sid) {
                    Some(layout) => self.structs.push(RequiredStruct {
                        generated_for_tuple: false,
                        type_id,
                        id: sid.clone(),
                        layout,
                    }),
                    None => self
                        .errors
                        .report(format!("Failed to find struct definition for '{sid}'")),
                }
            }

            _ => {}
        }
    }

    /// Note a vector element type; injects the typed append helper into
    /// scope on first sight.
    pub fn require_vector(&mut self, element: &Type, scope: &Scope) {
        let id = element.raw_identifier();
        if self.vectors.contains_key(&id) {
            return;
        }

        self.vectors.insert(id, element.clone());

        scope.add_c_function(CFunction {
            name: element.vector_append_name(),
            return_type: Type::Void,
            argument_types: vec![element.clone()],
        });
    }

    /// Tear down, yielding the module's contribution to the program
    /// aggregate.
    pub fn finish(self) -> (bool, FunctionGroup, usize) {
        (self.gpu_required, self.functions, self.max_closure_size)
    }
}

/// Field name for position `i` of a synthesized tuple struct.
pub fn tuple_field_name(i: usize) -> String {
    format!("f{i}")
}
