/// Construction options for a [`crate::runtime::Machine`].
#[derive(Debug, Clone, Copy)]
pub struct MachineOptions {
  memory_max: usize,
  stack_size: usize,
  brk_size: usize,
  verbose_loader: bool,
  verbose_syscalls: bool,
}

impl Default for MachineOptions {
  fn default() -> Self {
    Self {
      memory_max: 256 * 1024 * 1024,
      stack_size: 2 * 1024 * 1024,
      brk_size: 1024 * 1024,
      verbose_loader: false,
      verbose_syscalls: false,
    }
  }
}

impl MachineOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Apply functional options, e.g.
  /// `MachineOptions::default().with_options(vec![with_memory_max(1 << 20)])`.
  pub fn with_options(mut self, opts: impl IntoIterator<Item = impl FnOnce(&mut Self)>) -> Self {
    for opt in opts {
      opt(&mut self);
    }
    self
  }

  pub fn memory_max(&self) -> usize {
    self.memory_max
  }

  pub fn stack_size(&self) -> usize {
    self.stack_size
  }

  pub fn brk_size(&self) -> usize {
    self.brk_size
  }

  pub fn verbose_loader(&self) -> bool {
    self.verbose_loader
  }

  pub fn verbose_syscalls(&self) -> bool {
    self.verbose_syscalls
  }
}

pub fn with_memory_max(value: usize) -> impl FnOnce(&mut MachineOptions) {
  move |opts: &mut MachineOptions| {
    opts.memory_max = value;
  }
}

pub fn with_stack_size(value: usize) -> impl FnOnce(&mut MachineOptions) {
  move |opts: &mut MachineOptions| {
    opts.stack_size = value;
  }
}

pub fn with_brk_size(value: usize) -> impl FnOnce(&mut MachineOptions) {
  move |opts: &mut MachineOptions| {
    opts.brk_size = value;
  }
}

pub fn with_verbose_loader(value: bool) -> impl FnOnce(&mut MachineOptions) {
  move |opts: &mut MachineOptions| {
    opts.verbose_loader = value;
  }
}

pub fn with_verbose_syscalls(value: bool) -> impl FnOnce(&mut MachineOptions) {
  move |opts: &mut MachineOptions| {
    opts.verbose_syscalls = value;
  }
}
