// Build script to compile GLSL shaders to SPIR-V
//
// Every shaders/*.vert and shaders/*.frag is compiled next to its source
// as <name>.<stage>.spv, which is what the shader manifests reference.

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    let Ok(entries) = std::fs::read_dir("shaders") else {
        println!("cargo:warning=No shaders/ directory, skipping shader compilation");
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_stage = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("vert") | Some("frag")
        );
        if is_stage {
            let output = format!("{}.spv", path.display());
            compile_shader(&path, Path::new(&output));
        }
    }
}

fn compile_shader(input: &Path, output: &Path) {
    // Check if glslc is available
    let result = Command::new("glslc")
        .arg(input)
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("cargo:rerun-if-changed={}", input.display());
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input.display(), status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input.display());
            println!(
                "cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}",
                input.display(),
                output.display()
            );
        }
    }
}
