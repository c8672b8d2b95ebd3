/*
Copyright 2020 <盏一 w@hidva.com>
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
//! Controller entry point: a small standalone binary hosting the single
//! logical `Controller` service that every worker node registers with.
use clap::Parser;
use nuproc::controller::{server, Controller};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(name = "nuproc-controller", version)]
struct Args {
    #[clap(long, default_value = "0.0.0.0")]
    bind_addr: Ipv4Addr,
    #[clap(long, default_value_t = 8001)]
    bind_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nuproc::init_tracing();
    let args = Args::parse();
    let ctrl = Arc::new(Controller::new());
    let bind = std::net::SocketAddr::new(args.bind_addr.into(), args.bind_port);
    server::run(ctrl, bind).await
}
