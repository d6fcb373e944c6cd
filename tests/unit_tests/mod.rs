mod adaptivity;
mod assembly;
mod features;
mod lifecycle;
mod postprocessors;
mod setup;
mod threads;
mod time_integration;
