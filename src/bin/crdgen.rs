//! # CRD Generator
//!
//! Prints the JobRequest CustomResourceDefinition as YAML.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/jobrequest.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use job_operator::crd::JobRequest;
use kube::CustomResourceExt;

fn main() {
    let crd = JobRequest::crd();

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
