//! CLI definitions using clap

use clap::Parser;
use std::path::PathBuf;

/// plughost - run a plugin that can be rebuilt and swapped while the host keeps running
#[derive(Parser, Debug)]
#[command(name = "plughost")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Project root (default: nearest ancestor of the executable or the
    /// working directory that contains the plugins directory)
    #[arg(short, long, env = "PLUGHOST_ROOT")]
    pub root: Option<PathBuf>,

    /// Settings file (default: appsettings.<ext> in the project root)
    #[arg(short = 'c', long, env = "PLUGHOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Plugins directory name, relative to the project root
    #[arg(short = 'p', long)]
    pub plugins_dir: Option<String>,

    /// Plugin library name without platform prefix or suffix
    #[arg(short, long)]
    pub module: Option<String>,
}
