//! The interpreter facade: options, model loading, and tensor binding

use crate::buffer::MemoryPool;
use crate::error::{Result, RuntimeError};
use crate::function::RuntimeFunction;
use crate::module::{create_module, ModuleSummary, RuntimeModule};
use crate::section::{FunctionInitContext, ModelData, ModuleInitContext, ReadSeek, Source};
use crate::tensor::{host_tensor, RuntimeTensor};
use crate::value::{conforms, Value};
use kmdl_core::{bytes_of, Datatype, FromScalar, Scalar, Shape, TensorType, Type};
use kmdl_model::{
    align_up, decode_type, name_to_str, FunctionHeader, ModelHeader, ModelRead, ModuleHeader,
    SectionHeader, MODEL_HAS_NO_ENTRY,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Typed name → scalar option map
#[derive(Default)]
pub struct OptionsDict {
    values: HashMap<String, Scalar>,
}

impl OptionsDict {
    /// Read an option; a missing key is `ResultOutOfRange`, a type
    /// mismatch `InvalidArgument`
    pub fn get<T: FromScalar>(&self, name: &str) -> Result<T> {
        let scalar = self
            .values
            .get(name)
            .ok_or_else(|| RuntimeError::out_of_range(format!("option '{}'", name)))?;
        T::from_scalar(scalar).ok_or_else(|| {
            RuntimeError::invalid_argument(format!("option '{}' holds a {}", name, scalar.dtype()))
        })
    }

    /// Set an option
    pub fn set<T: Into<Scalar>>(&mut self, name: &str, value: T) {
        self.values.insert(name.to_string(), value.into());
    }
}

/// Describes one positional input or output of the V1 API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Element datatype
    pub datatype: Datatype,
    /// Byte offset in the packed argument block
    pub start: usize,
    /// Byte length
    pub size: usize,
}

struct LoadedModule {
    module: Box<dyn RuntimeModule>,
    functions: Vec<Box<dyn RuntimeFunction>>,
}

/// Loads models and executes their entry function.
///
/// One interpreter is single-threaded: an `invoke` runs to completion on
/// the calling thread. Use one interpreter per thread for parallelism.
#[derive(Default)]
pub struct Interpreter {
    modules: Vec<LoadedModule>,
    entry: Option<(usize, usize)>,
    options: OptionsDict,
    inputs: Vec<Option<RuntimeTensor>>,
    outputs: Vec<Option<RuntimeTensor>>,
}

impl Interpreter {
    /// Create an interpreter with no model loaded
    pub fn new() -> Interpreter {
        Interpreter::default()
    }

    /// Interpreter options
    pub fn options(&mut self) -> &mut OptionsDict {
        &mut self.options
    }

    /// Load a model from a pinned byte image.
    ///
    /// On failure the interpreter keeps its previous state.
    pub fn load_model(&mut self, image: &[u8]) -> Result<()> {
        let data = Arc::new(ModelData::from_vec(image.to_vec()));
        self.install(Source::pinned(data))
    }

    /// Load a model by memory-mapping a file
    pub fn load_model_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| RuntimeError::IOError {
            reason: e.to_string(),
        })?;
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| RuntimeError::IOError {
            reason: e.to_string(),
        })?;
        let data = Arc::new(ModelData::from_mmap(map));
        self.install(Source::pinned(data))
    }

    /// Load a model from a seekable stream; sections are read on demand
    pub fn load_model_stream(&mut self, reader: impl ReadSeek + 'static) -> Result<()> {
        self.install(Source::streamed(Box::new(reader)))
    }

    fn install(&mut self, mut source: Source) -> Result<()> {
        let (modules, entry) = load(&mut source)?;
        self.modules = modules;
        self.entry = entry;
        self.inputs.clear();
        self.outputs.clear();
        if let Some((m, f)) = self.entry {
            let function = &self.modules[m].functions[f];
            let inputs = function.parameters_size() as usize;
            let outputs = return_arity(&function.return_type());
            self.inputs.resize(inputs, None);
            self.outputs.resize(outputs, None);
        }
        Ok(())
    }

    /// Access a loaded module by index
    pub fn find_module_by_id(&mut self, index: usize) -> Result<&mut (dyn RuntimeModule + '_)> {
        let count = self.modules.len();
        match self.modules.get_mut(index) {
            Some(m) => Ok(m.module.as_mut()),
            None => Err(RuntimeError::not_found(format!(
                "module {} of {} loaded",
                index, count
            ))),
        }
    }

    /// Number of loaded modules
    pub fn modules_size(&self) -> usize {
        self.modules.len()
    }

    // ----- V1 tensor-oriented API -----

    /// Number of entry-function inputs
    pub fn inputs_size(&self) -> usize {
        self.inputs.len()
    }

    /// Number of entry-function outputs
    pub fn outputs_size(&self) -> usize {
        self.outputs.len()
    }

    /// Descriptor of input `index`
    pub fn input_desc(&self, index: usize) -> Result<TensorDesc> {
        let types = self.input_types()?;
        packed_desc(&types, index)
    }

    /// Descriptor of output `index`
    pub fn output_desc(&self, index: usize) -> Result<TensorDesc> {
        let types = self.output_types()?;
        packed_desc(&types, index)
    }

    /// Shape of input `index`
    pub fn input_shape(&self, index: usize) -> Result<Shape> {
        let types = self.input_types()?;
        tensor_of(&types, index).map(|t| t.shape.clone())
    }

    /// Shape of output `index`
    pub fn output_shape(&self, index: usize) -> Result<Shape> {
        let types = self.output_types()?;
        tensor_of(&types, index).map(|t| t.shape.clone())
    }

    /// The tensor bound to input `index`, allocating a default host tensor
    /// on first access
    pub fn input_tensor(&mut self, index: usize) -> Result<RuntimeTensor> {
        let types = self.input_types()?;
        let declared = tensor_of(&types, index)?.clone();
        let slot = self
            .inputs
            .get_mut(index)
            .ok_or_else(|| RuntimeError::invalid_argument("input index out of range"))?;
        if slot.is_none() {
            *slot = Some(host_tensor::create(
                declared.dtype,
                declared.shape.clone(),
                MemoryPool::SharedFirst,
            )?);
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Bind a tensor to input `index`
    pub fn set_input_tensor(&mut self, index: usize, tensor: RuntimeTensor) -> Result<()> {
        let types = self.input_types()?;
        let declared = Type::Tensor(tensor_of(&types, index)?.clone());
        if !conforms(&tensor.ty(), &declared) {
            return Err(RuntimeError::invalid_argument(format!(
                "input {} has type {}, declared {}",
                index,
                tensor.ty(),
                declared
            )));
        }
        self.inputs[index] = Some(tensor);
        Ok(())
    }

    /// The tensor bound to output `index`, allocating a default host
    /// tensor on first access
    pub fn output_tensor(&mut self, index: usize) -> Result<RuntimeTensor> {
        let types = self.output_types()?;
        let declared = tensor_of(&types, index)?.clone();
        let slot = self
            .outputs
            .get_mut(index)
            .ok_or_else(|| RuntimeError::invalid_argument("output index out of range"))?;
        if slot.is_none() {
            *slot = Some(host_tensor::create(
                declared.dtype,
                declared.shape.clone(),
                MemoryPool::SharedFirst,
            )?);
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Bind a tensor to output `index`
    pub fn set_output_tensor(&mut self, index: usize, tensor: RuntimeTensor) -> Result<()> {
        let types = self.output_types()?;
        let declared = Type::Tensor(tensor_of(&types, index)?.clone());
        if !conforms(&tensor.ty(), &declared) {
            return Err(RuntimeError::invalid_argument(format!(
                "output {} has type {}, declared {}",
                index,
                tensor.ty(),
                declared
            )));
        }
        self.outputs[index] = Some(tensor);
        Ok(())
    }

    /// Invoke the entry function over the bound tensors.
    ///
    /// Unbound inputs are allocated (zero-filled); results land in the
    /// bound output tensors.
    pub fn run(&mut self) -> Result<()> {
        for index in 0..self.inputs_size() {
            self.input_tensor(index)?;
        }
        for index in 0..self.outputs_size() {
            self.output_tensor(index)?;
        }
        let parameters: Vec<Value> = self
            .inputs
            .iter()
            .map(|t| Value::Tensor(t.clone().unwrap()))
            .collect();

        let (m, f) = self
            .entry
            .ok_or_else(|| RuntimeError::not_found("entry function"))?;
        let result = self.modules[m].functions[f].invoke(&parameters, None)?;

        match (&result, self.outputs.len()) {
            (Value::Tensor(tensor), 1) => {
                tensor.copy_to(self.outputs[0].as_ref().unwrap())?;
            }
            (Value::Tuple(fields), n) if fields.len() == n => {
                for (field, out) in fields.iter().zip(&self.outputs) {
                    field.as_tensor()?.copy_to(out.as_ref().unwrap())?;
                }
            }
            _ => {
                return Err(RuntimeError::invalid_program(
                    "entry result does not match the declared outputs",
                ))
            }
        }
        Ok(())
    }

    // ----- V2 value-oriented API -----

    /// Find a function by its table name
    pub fn find_function_by_name(&mut self, name: &str) -> Result<&mut dyn RuntimeFunction> {
        for loaded in &mut self.modules {
            if let Some(index) = loaded
                .module
                .function_names()
                .iter()
                .position(|n| n == name)
            {
                return Ok(loaded.functions[index].as_mut());
            }
        }
        Err(RuntimeError::not_found(format!("function '{}'", name)))
    }

    /// The model's entry function
    pub fn entry_function(&mut self) -> Result<&mut dyn RuntimeFunction> {
        let (m, f) = self
            .entry
            .ok_or_else(|| RuntimeError::not_found("entry function"))?;
        Ok(self.modules[m].functions[f].as_mut())
    }

    fn input_types(&self) -> Result<Vec<TensorType>> {
        let (m, f) = self
            .entry
            .ok_or_else(|| RuntimeError::not_found("entry function"))?;
        let function = &self.modules[m].functions[f];
        (0..function.parameters_size() as usize)
            .map(|i| {
                let ty = function.parameter_type(i)?;
                match ty {
                    Type::Tensor(t) => Ok(t),
                    other => Err(RuntimeError::not_supported(format!(
                        "non-tensor input of type {} in the positional API",
                        other
                    ))),
                }
            })
            .collect()
    }

    fn output_types(&self) -> Result<Vec<TensorType>> {
        let (m, f) = self
            .entry
            .ok_or_else(|| RuntimeError::not_found("entry function"))?;
        let function = &self.modules[m].functions[f];
        match function.return_type() {
            Type::Tensor(t) => Ok(vec![t]),
            Type::Tuple(fields) => fields
                .into_iter()
                .map(|field| match field {
                    Type::Tensor(t) => Ok(t),
                    other => Err(RuntimeError::not_supported(format!(
                        "non-tensor output of type {} in the positional API",
                        other
                    ))),
                })
                .collect(),
            other => Err(RuntimeError::not_supported(format!(
                "return type {} in the positional API",
                other
            ))),
        }
    }
}

fn return_arity(ty: &Type) -> usize {
    match ty {
        Type::Tuple(fields) => fields.len(),
        _ => 1,
    }
}

fn tensor_of(types: &[TensorType], index: usize) -> Result<&TensorType> {
    types.get(index).ok_or_else(|| {
        RuntimeError::invalid_argument(format!(
            "tensor index {} out of range ({} declared)",
            index,
            types.len()
        ))
    })
}

fn packed_desc(types: &[TensorType], index: usize) -> Result<TensorDesc> {
    let mut start = 0;
    for (i, t) in types.iter().enumerate() {
        let size = bytes_of(t.dtype, &t.shape);
        if i == index {
            return Ok(TensorDesc {
                datatype: t.dtype,
                start,
                size,
            });
        }
        start += size;
    }
    Err(RuntimeError::invalid_argument(format!(
        "tensor index {} out of range ({} declared)",
        index,
        types.len()
    )))
}

fn load(source: &mut Source) -> Result<(Vec<LoadedModule>, Option<(usize, usize)>)> {
    let header = ModelHeader::read(source)?;
    let alignment = header.alignment as u64;
    log::debug!(
        "loading model: {} modules, alignment {}",
        header.modules,
        header.alignment
    );

    let mut modules = Vec::with_capacity(header.modules as usize);
    for _ in 0..header.modules {
        let module_start = align_up(source.position()?, alignment);
        source.seek(module_start)?;
        let module_header = ModuleHeader::read(source)?;
        let module_end = module_start + module_header.size;

        let mut section_headers = Vec::with_capacity(module_header.sections as usize);
        for _ in 0..module_header.sections {
            section_headers.push(SectionHeader::read(source)?);
        }

        let kind = name_to_str(&module_header.kind).to_string();
        log::debug!(
            "module '{}': {} sections, {} functions",
            kind,
            module_header.sections,
            module_header.functions
        );
        let mut module = create_module(&kind)?;

        let function_count = module_header.functions;
        let mut context =
            ModuleInitContext::new(source, module_start, module_header, section_headers);
        module.initialize_before_functions(&mut context)?;

        let mut functions = Vec::with_capacity(function_count as usize);
        for _ in 0..function_count {
            let record_start = context.source.position()?;
            let function_header = FunctionHeader::read(context.source)?;
            let record_end = record_start + function_header.size;

            let mut parameter_types = Vec::with_capacity(function_header.parameters as usize);
            for _ in 0..function_header.parameters {
                parameter_types.push(decode_type(context.source)?);
            }
            let return_type = decode_type(context.source)?;

            let mut fn_sections = Vec::with_capacity(function_header.sections as usize);
            for _ in 0..function_header.sections {
                fn_sections.push(SectionHeader::read(context.source)?);
            }

            let text_start = context.source.position()?;
            if text_start + function_header.text_size != record_end {
                return Err(RuntimeError::invalid_program(
                    "function record size mismatch",
                ));
            }

            let base = crate::function::FunctionBase::new(
                function_header.clone(),
                parameter_types,
                return_type,
            );
            let mut function_context = FunctionInitContext {
                module: &mut context,
                header: function_header,
                section_headers: fn_sections,
                text_start,
            };
            functions.push(module.create_function(base, &mut function_context)?);
            context.source.seek(record_end)?;
        }

        module.initialize_after_functions(&mut context)?;
        drop(context);
        source.seek(module_end)?;
        modules.push(LoadedModule { module, functions });
    }

    let entry = if header.entry_module == MODEL_HAS_NO_ENTRY {
        None
    } else {
        let m = header.entry_module as usize;
        let f = header.entry_function as usize;
        let functions = modules
            .get(m)
            .map(|loaded| loaded.functions.len())
            .ok_or_else(|| RuntimeError::invalid_program("entry module out of range"))?;
        if f >= functions {
            return Err(RuntimeError::invalid_program("entry function out of range"));
        }
        Some((m, f))
    };

    let directory: Vec<ModuleSummary> = modules
        .iter()
        .map(|loaded| ModuleSummary {
            kind: loaded.module.kind().to_string(),
            functions: loaded.functions.len(),
        })
        .collect();
    for loaded in &mut modules {
        loaded.module.resolve(&directory)?;
    }

    Ok((modules, entry))
}
