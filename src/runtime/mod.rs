pub mod host;
pub mod queue;
pub mod registry;
pub mod runtime_error;
pub mod script;
pub mod vm_bc;

#[cfg(test)]
mod test_host;
