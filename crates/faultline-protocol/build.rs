// Copyright (c) 2026 Faultline Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to find vendored protoc");
    std::env::set_var("PROTOC", protoc);
    let well_known =
        protoc_bin_vendored::include_path().expect("failed to find vendored protoc includes");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/runtime_v2.proto",
                "proto/runtime_v3.proto",
                "proto/chaos.proto",
            ],
            &[PathBuf::from("proto"), well_known],
        )
        .expect("failed to compile runtime discovery protos");
}
