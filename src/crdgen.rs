//! # CRD Generator
//!
//! Generates the `SecretIntent` CustomResourceDefinition YAML from the Rust
//! type definition.
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/secretintent.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use keychain_secrets_controller::crd::SecretIntent;
use kube::core::CustomResourceExt;

fn main() {
    let crd = SecretIntent::crd();

    match serde_yaml::to_string(&crd) {
        Ok(yaml) => {
            println!("# This file is auto-generated by crdgen");
            println!("# DO NOT EDIT THIS FILE MANUALLY");
            println!("---");
            print!("{yaml}");
        }
        Err(e) => {
            eprintln!("Failed to serialize CRD to YAML: {e}");
            std::process::exit(1);
        }
    }
}
