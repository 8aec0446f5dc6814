// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use starmap::star_server::server_main;

fn main() {
    server_main();
}
