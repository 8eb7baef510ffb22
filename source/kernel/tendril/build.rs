// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    for var in ["TENDRIL_CALLSIGN", "TENDRIL_HEAP_SIZE", "TENDRIL_LOG_CAPACITY", "TENDRIL_UART_BASE"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-changed=src/arch/armv7/vectors.S");
}
